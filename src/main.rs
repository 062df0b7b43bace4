mod console;
mod tui;

use std::{
    io,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use iq_ring::{
    monitor::Monitor,
    session::{Session, SessionConfig},
    source::{FileSource, IqSource, SampleFormat, ToneSource},
    DEFAULT_CAPACITY,
};

const CONSOLE_LINES: usize = 200;
const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const TONE_AMPLITUDE: f32 = 0.7;

/// Stream IQ samples from a recording, or a test tone, through a bounded
/// sample ring and report how the consumer keeps up.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// raw IQ recording; a synthetic tone is used when omitted
    #[arg(index = 1)]
    file: Option<PathBuf>,

    /// layout of the recording: cf32, cs16 or cs8
    #[arg(short, long, default_value_t = SampleFormat::Cf32)]
    format: SampleFormat,

    /// sample rate in Hz
    #[arg(short, long, default_value_t = 2_000_000)]
    rate: u32,

    /// tone offset in Hz when no recording is given
    #[arg(long, default_value_t = 100_000.0)]
    tone: f64,

    /// initial ring capacity in floats
    #[arg(short, long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,

    /// floats per processing block, even so blocks hold whole IQ pairs
    #[arg(short, long, default_value_t = 16_384)]
    block: usize,

    /// largest producer chunk in complex samples
    #[arg(long, default_value_t = 8_192)]
    chunk: usize,

    /// hold the producer to the sample rate
    #[arg(long)]
    pace: bool,

    /// start the recording over at end of file
    #[arg(long = "loop")]
    looping: bool,

    /// seconds to run, 0 runs until the recording ends
    #[arg(short, long, default_value_t = 0.0)]
    duration: f64,

    /// show the terminal dashboard
    #[arg(long)]
    tui: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let console = if args.tui {
        Some(console::init_console_logging(CONSOLE_LINES))
    } else {
        console::init_stderr_logging();
        None
    };

    let run_for = run_limit(args.duration)?;
    let source = open_source(&args)?;
    let info = source.describe();
    let monitor = Arc::new(Monitor::new());
    let config = SessionConfig {
        capacity: args.capacity,
        block: args.block,
        pace: args.pace,
    };
    let session = Session::start(source, config, Arc::clone(&monitor))?;

    // too far out to represent means no deadline at all
    let deadline = run_for.and_then(|limit| Instant::now().checked_add(limit));
    let keep_going =
        || session.is_capturing() && deadline.map_or(true, |deadline| Instant::now() < deadline);

    let mut quit = false;
    if let Some(console) = &console {
        let mut dashboard = tui::Dashboard::enter().context("set up terminal")?;
        let status = tui::run_app(
            console,
            dashboard.terminal(),
            Duration::from_millis(33),
            &monitor,
            &info,
            &keep_going,
        );
        drop(dashboard);
        quit = matches!(status.context("run dashboard")?, tui::ExitStatus::Quit);
        if !quit {
            // the dashboard is gone, so show what it was holding
            console.lock().echo_to(Box::new(io::stderr()))?;
        }
    }
    if !quit {
        wait_and_report(&monitor, &keep_going);
    }

    let report = session.stop()?;
    println!(
        "{} blocks processed; dropped {} of {} chunks ({} samples); ring capacity {} after {} resizes",
        report.blocks,
        report.capture.dropped_chunks,
        report.capture.chunks,
        report.capture.dropped_samples,
        report.ring.capacity,
        report.ring.resizes,
    );

    Ok(())
}

/// How long to run, `None` for as long as the source lasts.
fn run_limit(seconds: f64) -> Result<Option<Duration>> {
    if seconds == 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .with_context(|| format!("invalid duration {seconds}"))
}

fn open_source(args: &Args) -> Result<Box<dyn IqSource>> {
    Ok(match &args.file {
        Some(path) => Box::new(
            FileSource::open(path, args.format, args.rate, args.chunk)?.looping(args.looping),
        ),
        None => Box::new(ToneSource::new(
            args.rate,
            args.tone,
            TONE_AMPLITUDE,
            args.chunk,
        )?),
    })
}

fn wait_and_report(monitor: &Monitor, keep_going: impl Fn() -> bool) {
    let mut last_report = Instant::now();

    while keep_going() {
        thread::sleep(Duration::from_millis(50));

        if last_report.elapsed() >= REPORT_INTERVAL {
            last_report = Instant::now();
            let snapshot = monitor.snapshot();
            info!(
                blocks = snapshot.blocks,
                fill = %format!("{:.1}%", snapshot.fill * 100.0),
                capacity = snapshot.capacity,
                dropped = snapshot.dropped_chunks,
                power_dbfs = %format!("{:.1}", snapshot.last.power_dbfs()),
                "streaming"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_duration_runs_until_done() {
        assert_eq!(run_limit(0.0).unwrap(), None);
        assert_eq!(run_limit(1.5).unwrap(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unrepresentable_durations_are_rejected() {
        for seconds in [f64::INFINITY, f64::NAN, -1.0] {
            assert!(run_limit(seconds).is_err(), "{seconds}");
        }
    }

    #[test]
    fn block_and_duration_flags_parse() {
        let args = Args::try_parse_from(["iq-ring", "-b", "64", "-d", "2"]).unwrap();
        assert_eq!(args.block, 64);
        assert_eq!(run_limit(args.duration).unwrap(), Some(Duration::from_secs(2)));
        assert!(args.file.is_none());
    }
}
