//! Chunk sources standing in for a radio front end.
//!
//! Every source hands out interleaved `[re, im, re, im, ...]` floats in
//! bursts of varying size, the way a capture callback would.

use std::{
    f64::consts::TAU,
    fmt,
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

pub trait IqSource: Send {
    /// Replace `out` with the next chunk. `Ok(false)` at end of stream.
    fn next_chunk(&mut self, out: &mut Vec<f32>) -> Result<bool>;

    fn sample_rate(&self) -> u32;

    /// Largest chunk this source emits, in floats.
    fn max_chunk(&self) -> usize;

    fn describe(&self) -> String;
}

/// On-disk layout of a raw IQ recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Pairs of little-endian f32.
    Cf32,
    /// Pairs of little-endian i16.
    Cs16,
    /// Pairs of i8.
    Cs8,
}

impl SampleFormat {
    pub fn bytes_per_complex(self) -> usize {
        match self {
            SampleFormat::Cf32 => 8,
            SampleFormat::Cs16 => 4,
            SampleFormat::Cs8 => 2,
        }
    }

    /// Append the floats encoded in `bytes`, which hold whole complex samples.
    fn decode_into(self, bytes: &[u8], out: &mut Vec<f32>) {
        match self {
            SampleFormat::Cf32 => out.extend(
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            ),
            SampleFormat::Cs16 => out.extend(
                bytes
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0),
            ),
            SampleFormat::Cs8 => out.extend(bytes.iter().map(|&b| b as i8 as f32 / 128.0)),
        }
    }
}

impl FromStr for SampleFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cf32" | "fc32" => Ok(SampleFormat::Cf32),
            "cs16" | "sc16" => Ok(SampleFormat::Cs16),
            "cs8" | "sc8" => Ok(SampleFormat::Cs8),
            other => bail!("unknown sample format {other:?}, expected cf32, cs16 or cs8"),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::Cf32 => write!(f, "cf32"),
            SampleFormat::Cs16 => write!(f, "cs16"),
            SampleFormat::Cs8 => write!(f, "cs8"),
        }
    }
}

/// Expand a leading `~` and make relative paths absolute.
pub fn expand_home_dir(path: &Path) -> Result<PathBuf> {
    let path = match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .context("no home directory to expand `~`")?
            .join(rest),
        Err(_) => path.to_path_buf(),
    };

    if path.is_relative() {
        Ok(std::env::current_dir()
            .context("resolve current directory")?
            .join(path))
    } else {
        Ok(path)
    }
}

/// Replays a raw IQ recording.
pub struct FileSource {
    path: PathBuf,
    reader: BufReader<File>,
    format: SampleFormat,
    sample_rate: u32,
    /// Complex samples per chunk.
    chunk: usize,
    looping: bool,
    raw: Vec<u8>,
}

impl FileSource {
    pub fn open(path: &Path, format: SampleFormat, sample_rate: u32, chunk: usize) -> Result<Self> {
        if sample_rate == 0 {
            bail!("sample rate must be non-zero");
        }
        if chunk == 0 {
            bail!("chunk size must be non-zero");
        }

        let path = expand_home_dir(path)?;
        let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        info!(path = %path.display(), %format, sample_rate, "reading IQ recording");

        Ok(Self {
            path,
            reader: BufReader::with_capacity(1 << 20, file),
            format,
            sample_rate,
            chunk,
            looping: false,
            raw: vec![0; chunk * format.bytes_per_complex()],
        })
    }

    /// Start over at end of file instead of ending the stream.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Fill `raw` as far as the file allows. Returns the byte count.
    fn fill(&mut self) -> io::Result<usize> {
        let mut filled = 0;
        while filled < self.raw.len() {
            match self.reader.read(&mut self.raw[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl IqSource for FileSource {
    fn next_chunk(&mut self, out: &mut Vec<f32>) -> Result<bool> {
        out.clear();

        let mut filled = self.fill().context("read IQ recording")?;
        if filled == 0 && self.looping {
            debug!(path = %self.path.display(), "rewinding recording");
            self.reader
                .seek(SeekFrom::Start(0))
                .context("rewind IQ recording")?;
            filled = self.fill().context("read IQ recording")?;
        }

        // a trailing partial complex sample is dropped
        let whole = filled - filled % self.format.bytes_per_complex();
        if whole == 0 {
            return Ok(false);
        }

        self.format.decode_into(&self.raw[..whole], out);
        Ok(true)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn max_chunk(&self) -> usize {
        self.chunk * 2
    }

    fn describe(&self) -> String {
        format!(
            "{} ({}, {} S/s)",
            self.path.display(),
            self.format,
            self.sample_rate
        )
    }
}

/// Synthetic complex tone delivered in bursts of uneven size.
pub struct ToneSource {
    sample_rate: u32,
    tone_hz: f64,
    amplitude: f32,
    /// Complex samples in the largest burst.
    max_chunk: usize,
    phase: f64,
    burst_seed: u32,
}

impl ToneSource {
    pub fn new(sample_rate: u32, tone_hz: f64, amplitude: f32, max_chunk: usize) -> Result<Self> {
        if sample_rate == 0 {
            bail!("sample rate must be non-zero");
        }
        if max_chunk == 0 {
            bail!("chunk size must be non-zero");
        }

        Ok(Self {
            sample_rate,
            tone_hz,
            amplitude,
            max_chunk,
            phase: 0.0,
            burst_seed: 0x9e37_79b9,
        })
    }

    /// Complex samples in the next burst, between a quarter and all of
    /// `max_chunk`.
    fn next_burst(&mut self) -> usize {
        // xorshift32
        let mut x = self.burst_seed;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.burst_seed = x;

        let min = (self.max_chunk / 4).max(1);
        min + x as usize % (self.max_chunk - min + 1)
    }
}

impl IqSource for ToneSource {
    fn next_chunk(&mut self, out: &mut Vec<f32>) -> Result<bool> {
        out.clear();

        let step = TAU * self.tone_hz / self.sample_rate as f64;
        for _ in 0..self.next_burst() {
            out.push(self.amplitude * self.phase.cos() as f32);
            out.push(self.amplitude * self.phase.sin() as f32);
            self.phase = (self.phase + step) % TAU;
        }
        Ok(true)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn max_chunk(&self) -> usize {
        self.max_chunk * 2
    }

    fn describe(&self) -> String {
        format!(
            "tone {:+} Hz ({} S/s)",
            self.tone_hz, self.sample_rate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    #[test]
    fn parse_formats() {
        assert_eq!("CF32".parse::<SampleFormat>().unwrap(), SampleFormat::Cf32);
        assert_eq!("sc16".parse::<SampleFormat>().unwrap(), SampleFormat::Cs16);
        assert_eq!("cs8".parse::<SampleFormat>().unwrap(), SampleFormat::Cs8);
        assert!("u8".parse::<SampleFormat>().is_err());
    }

    #[test]
    fn read_cf32_in_chunks() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("capture.cf32");
        let samples = [0.5f32, -0.5, 0.25, -0.25, 1.0, -1.0];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        fs::write(&file, bytes).unwrap();

        let mut source = FileSource::open(&file, SampleFormat::Cf32, 1_000, 2).unwrap();
        assert_eq!(source.max_chunk(), 4);

        let mut chunk = Vec::new();
        assert!(source.next_chunk(&mut chunk).unwrap());
        assert_eq!(chunk, vec![0.5, -0.5, 0.25, -0.25]);
        assert!(source.next_chunk(&mut chunk).unwrap());
        assert_eq!(chunk, vec![1.0, -1.0]);
        assert!(!source.next_chunk(&mut chunk).unwrap());
        assert!(chunk.is_empty());
    }

    #[test]
    fn scale_integer_formats() {
        let dir = TempDir::new().unwrap();

        let cs16 = dir.path().join("capture.cs16");
        let bytes: Vec<u8> = [16384i16, -32768]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        fs::write(&cs16, bytes).unwrap();
        let mut source = FileSource::open(&cs16, SampleFormat::Cs16, 1_000, 8).unwrap();
        let mut chunk = Vec::new();
        assert!(source.next_chunk(&mut chunk).unwrap());
        assert_eq!(chunk, vec![0.5, -1.0]);

        let cs8 = dir.path().join("capture.cs8");
        fs::write(&cs8, [64u8, 0x80, 0]).unwrap(); // last byte is half a sample
        let mut source = FileSource::open(&cs8, SampleFormat::Cs8, 1_000, 8).unwrap();
        assert!(source.next_chunk(&mut chunk).unwrap());
        assert_eq!(chunk, vec![0.5, -1.0]);
        assert!(!source.next_chunk(&mut chunk).unwrap());
    }

    #[test]
    fn loop_at_end_of_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("capture.cs8");
        fs::write(&file, [64u8, 64]).unwrap();

        let mut source = FileSource::open(&file, SampleFormat::Cs8, 1_000, 1)
            .unwrap()
            .looping(true);
        let mut chunk = Vec::new();
        for _ in 0..3 {
            assert!(source.next_chunk(&mut chunk).unwrap());
            assert_eq!(chunk, vec![0.5, 0.5]);
        }
    }

    #[test]
    fn empty_file_ends_even_when_looping() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("empty.cf32");
        fs::write(&file, b"").unwrap();

        let mut source = FileSource::open(&file, SampleFormat::Cf32, 1_000, 4)
            .unwrap()
            .looping(true);
        assert!(!source.next_chunk(&mut Vec::new()).unwrap());
    }

    #[test]
    fn zero_rate_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("capture.cf32");
        fs::write(&file, 1.0f32.to_le_bytes()).unwrap();

        let err = FileSource::open(&file, SampleFormat::Cf32, 0, 8)
            .err()
            .unwrap();
        assert!(err.to_string().contains("sample rate"));
    }

    #[test]
    fn missing_file_names_path() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("missing.cf32");
        let err = FileSource::open(&file, SampleFormat::Cf32, 1_000, 4)
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("missing.cf32"));
    }

    #[test]
    fn tone_bursts_stay_in_bounds() {
        let mut source = ToneSource::new(48_000, 1_000.0, 0.5, 64).unwrap();
        let mut chunk = Vec::new();
        let mut sizes = Vec::new();

        for _ in 0..100 {
            assert!(source.next_chunk(&mut chunk).unwrap());
            assert_eq!(chunk.len() % 2, 0);
            assert!(chunk.len() >= 32 && chunk.len() <= source.max_chunk());
            for pair in chunk.chunks_exact(2) {
                let magnitude = (pair[0] * pair[0] + pair[1] * pair[1]).sqrt();
                assert!((magnitude - 0.5).abs() < 1e-4);
            }
            sizes.push(chunk.len());
        }

        sizes.dedup();
        assert!(sizes.len() > 1, "bursts should vary in size");
    }

    #[test]
    fn relative_paths_become_absolute() {
        let path = expand_home_dir(Path::new("capture.cf32")).unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("capture.cf32"));
    }
}
