//! What the processing thread reports back to the front end.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    Mutex, PoisonError,
};

use crate::ring::RingStats;

/// Complex samples kept for the scope view.
pub const SCOPE_LEN: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockStats {
    /// Mean of `re² + im²`.
    pub mean_power: f32,
    /// Largest magnitude seen.
    pub peak: f32,
}

impl BlockStats {
    pub fn from_interleaved(block: &[f32]) -> Self {
        let mut energy = 0.0f64;
        let mut peak_sq = 0.0f32;
        let mut pairs = 0usize;

        for pair in block.chunks_exact(2) {
            let power = pair[0] * pair[0] + pair[1] * pair[1];
            energy += power as f64;
            peak_sq = peak_sq.max(power);
            pairs += 1;
        }

        if pairs == 0 {
            return Self::default();
        }
        Self {
            mean_power: (energy / pairs as f64) as f32,
            peak: peak_sq.sqrt(),
        }
    }

    /// Mean power relative to a full-scale complex sinusoid.
    pub fn power_dbfs(&self) -> f32 {
        10.0 * self.mean_power.max(1e-12).log10()
    }
}

/// Snapshot handed to the dashboard and the log loop.
#[derive(Debug, Clone, Default)]
pub struct MonitorSnapshot {
    pub blocks: u64,
    pub samples: u64,
    pub fill: f32,
    pub capacity: usize,
    pub dropped_chunks: u64,
    pub resizes: u64,
    pub last: BlockStats,
    pub scope: Vec<(f32, f32)>,
}

/// Shared between the capture thread, the processing thread and the UI.
#[derive(Debug, Default)]
pub struct Monitor {
    scope: Mutex<Vec<(f32, f32)>>,
    blocks: AtomicU64,
    samples: AtomicU64,
    // f32 bits
    fill: AtomicU32,
    mean_power: AtomicU32,
    peak: AtomicU32,
    capacity: AtomicUsize,
    dropped_chunks: AtomicU64,
    resizes: AtomicU64,
    /// Freeze the scope view. Only the UI thread writes it.
    pub paused: AtomicBool,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_block(&self, block: &[f32]) -> BlockStats {
        let stats = BlockStats::from_interleaved(block);

        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(block.len() as u64, Ordering::Relaxed);
        self.mean_power
            .store(stats.mean_power.to_bits(), Ordering::Release);
        self.peak.store(stats.peak.to_bits(), Ordering::Release);

        if !self.paused.load(Ordering::Relaxed) {
            let tail = block.len().saturating_sub(SCOPE_LEN * 2);
            let mut scope = self.scope.lock().unwrap_or_else(PoisonError::into_inner);
            scope.clear();
            scope.extend(block[tail..].chunks_exact(2).map(|pair| (pair[0], pair[1])));
        }

        stats
    }

    pub fn record_ring(&self, stats: &RingStats) {
        self.fill
            .store(stats.fill_ratio().to_bits(), Ordering::Release);
        self.capacity.store(stats.capacity, Ordering::Release);
        self.dropped_chunks
            .store(stats.rejected_chunks, Ordering::Release);
        self.resizes.store(stats.resizes, Ordering::Release);
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            blocks: self.blocks.load(Ordering::Acquire),
            samples: self.samples.load(Ordering::Acquire),
            fill: f32::from_bits(self.fill.load(Ordering::Acquire)).clamp(0.0, 1.0),
            capacity: self.capacity.load(Ordering::Acquire),
            dropped_chunks: self.dropped_chunks.load(Ordering::Acquire),
            resizes: self.resizes.load(Ordering::Acquire),
            last: BlockStats {
                mean_power: f32::from_bits(self.mean_power.load(Ordering::Acquire)),
                peak: f32::from_bits(self.peak.load(Ordering::Acquire)),
            },
            scope: self
                .scope
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_power_and_peak() {
        let stats = BlockStats::from_interleaved(&[1.0, 0.0, 0.0, 0.5, 0.0, 0.0]);
        assert!((stats.mean_power - (1.0 + 0.25) / 3.0).abs() < 1e-6);
        assert_eq!(stats.peak, 1.0);

        let full_scale = BlockStats::from_interleaved(&[0.0, 1.0]);
        assert!(full_scale.power_dbfs().abs() < 1e-6);
    }

    #[test]
    fn empty_block_is_silent() {
        let stats = BlockStats::from_interleaved(&[0.3]);
        assert_eq!(stats, BlockStats::default());
        assert!((stats.power_dbfs() + 120.0).abs() < 1e-3);
    }

    #[test]
    fn scope_keeps_block_tail() {
        let monitor = Monitor::new();
        let block: Vec<f32> = (0..(SCOPE_LEN * 2 + 10)).map(|i| i as f32).collect();
        monitor.record_block(&block);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.blocks, 1);
        assert_eq!(snapshot.samples, block.len() as u64);
        assert_eq!(snapshot.scope.len(), SCOPE_LEN);
        assert_eq!(snapshot.scope[0], (10.0, 11.0));
    }

    #[test]
    fn paused_scope_is_frozen() {
        let monitor = Monitor::new();
        monitor.record_block(&[0.1, 0.2]);
        monitor.paused.store(true, Ordering::Relaxed);
        monitor.record_block(&[0.9, 0.9]);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.scope, vec![(0.1, 0.2)]);
        assert_eq!(snapshot.blocks, 2);
    }

    #[test]
    fn ring_fill_published() {
        let monitor = Monitor::new();
        monitor.record_ring(&RingStats {
            capacity: 8,
            buffered: 2,
            rejected_chunks: 3,
            ..RingStats::default()
        });

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.fill, 0.25);
        assert_eq!(snapshot.capacity, 8);
        assert_eq!(snapshot.dropped_chunks, 3);
    }
}
