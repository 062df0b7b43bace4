//! A capture session: one capture thread feeding the ring, one processing
//! thread draining it.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use crate::{
    monitor::Monitor,
    ring::{sample_ring, RingControl, RingError, RingStats, SampleConsumer, SampleProducer},
    source::IqSource,
};

/// Capacity requested per float of the largest chunk when the ring has to
/// grow to fit the source.
pub const RESIZE_HEADROOM: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Initial ring capacity in floats.
    pub capacity: usize,
    /// Floats per processing block.
    pub block: usize,
    /// Hold the source to its sample rate instead of reading flat out.
    pub pace: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureReport {
    pub chunks: u64,
    pub samples: u64,
    pub dropped_chunks: u64,
    pub dropped_samples: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionReport {
    pub capture: CaptureReport,
    pub blocks: u64,
    pub ring: RingStats,
}

pub struct Session {
    running: Arc<AtomicBool>,
    control: RingControl,
    capture: JoinHandle<Result<CaptureReport>>,
    processing: JoinHandle<Result<u64>>,
}

impl Session {
    pub fn start(
        source: Box<dyn IqSource>,
        config: SessionConfig,
        monitor: Arc<Monitor>,
    ) -> Result<Self> {
        if config.block == 0 {
            bail!("processing block must be non-zero");
        }
        // blocks hold whole [re, im] pairs
        if config.block % 2 != 0 {
            bail!("processing block must be even, got {}", config.block);
        }
        if config.pace && source.sample_rate() == 0 {
            bail!("cannot pace a source without a sample rate");
        }

        let (producer, consumer) = sample_ring(config.capacity).context("create sample ring")?;
        let control = producer.control();

        let needed = source.max_chunk().max(config.block);
        if needed > config.capacity {
            let capacity = needed * RESIZE_HEADROOM;
            info!(
                from = config.capacity,
                to = capacity,
                "ring too small for negotiated chunk, resizing"
            );
            control.request_resize(capacity)?;
        }
        monitor.record_ring(&control.stats());

        info!(source = %source.describe(), block = config.block, "starting session");

        let running = Arc::new(AtomicBool::new(true));

        let capture = {
            let running = Arc::clone(&running);
            let monitor = Arc::clone(&monitor);
            thread::Builder::new()
                .name("iq-capture".into())
                .spawn(move || capture_loop(source, producer, &running, config.pace, &monitor))
                .context("spawn capture thread")?
        };

        let processing = thread::Builder::new()
            .name("iq-process".into())
            .spawn(move || processing_loop(consumer, config.block, &monitor))
            .context("spawn processing thread")?;

        Ok(Self {
            running,
            control,
            capture,
            processing,
        })
    }

    /// False once the source ran dry or failed.
    pub fn is_capturing(&self) -> bool {
        !self.capture.is_finished()
    }

    pub fn ring(&self) -> &RingControl {
        &self.control
    }

    /// Stop capturing, release the processing thread and collect both.
    pub fn stop(self) -> Result<SessionReport> {
        self.running.store(false, Ordering::Release);

        let capture = self
            .capture
            .join()
            .map_err(|_| anyhow!("capture thread panicked"));
        // the processing thread must be released even if capture failed
        self.control.close();
        let blocks = self
            .processing
            .join()
            .map_err(|_| anyhow!("processing thread panicked"))?
            .context("processing")?;
        let capture = capture?.context("capture")?;

        let report = SessionReport {
            capture,
            blocks,
            ring: self.control.stats(),
        };
        info!(
            blocks = report.blocks,
            captured = report.capture.samples,
            dropped_chunks = report.capture.dropped_chunks,
            resizes = report.ring.resizes,
            "session stopped"
        );
        Ok(report)
    }
}

fn capture_loop(
    mut source: Box<dyn IqSource>,
    mut producer: SampleProducer,
    running: &AtomicBool,
    pace: bool,
    monitor: &Monitor,
) -> Result<CaptureReport> {
    let control = producer.control();
    let mut requested = control.stats().desired_capacity;
    let mut chunk = Vec::with_capacity(source.max_chunk());
    let mut report = CaptureReport::default();

    let floats_per_second = source.sample_rate() as f64 * 2.0;
    let started = Instant::now();

    while running.load(Ordering::Acquire) {
        if !source.next_chunk(&mut chunk)? {
            info!(samples = report.samples, "source exhausted");
            break;
        }
        report.chunks += 1;
        report.samples += chunk.len() as u64;

        if chunk.len() > requested {
            requested = chunk.len() * RESIZE_HEADROOM;
            info!(chunk = chunk.len(), capacity = requested, "chunk outgrew ring");
            control.request_resize(requested)?;
        }

        match producer.insert(&chunk) {
            Ok(()) => {}
            Err(RingError::Full { requested, free }) => {
                report.dropped_chunks += 1;
                report.dropped_samples += requested as u64;
                if report.dropped_chunks == 1 {
                    warn!(requested, free, "ring overrun, dropping chunk");
                } else {
                    debug!(requested, free, dropped = report.dropped_chunks, "ring overrun");
                }
            }
            Err(RingError::Closed) => break,
            Err(e) => return Err(e.into()),
        }
        monitor.record_ring(&control.stats());

        if pace {
            let due = Duration::from_secs_f64(report.samples as f64 / floats_per_second);
            if let Some(wait) = due.checked_sub(started.elapsed()) {
                thread::sleep(wait);
            }
        }
    }

    Ok(report)
}

fn processing_loop(mut consumer: SampleConsumer, block: usize, monitor: &Monitor) -> Result<u64> {
    let mut buffer = vec![0.0; block];
    let mut blocks = 0;

    loop {
        match consumer.remove_blocking(&mut buffer) {
            Ok(()) => {
                let stats = monitor.record_block(&buffer);
                blocks += 1;
                if blocks % 256 == 0 {
                    debug!(blocks, power_dbfs = stats.power_dbfs(), "processing");
                }
            }
            Err(RingError::Closed) => break,
            Err(e) => return Err(e).context("drain sample ring"),
        }
    }

    Ok(blocks)
}
