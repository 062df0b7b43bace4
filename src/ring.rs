//! Bounded sample ring between a capture thread and a processing thread.
//!
//! The capture side never waits: a chunk that does not fit is rejected whole
//! with [`RingError::Full`] and the caller drops it. The processing side blocks
//! in [`SampleConsumer::remove_blocking`] until a full block is buffered or
//! the ring is closed.
//!
//! All bookkeeping sits in one [`Mutex`]; a [`Condvar`] carries the wake-ups.
//! The lock is held for the bookkeeping update and the sample copy, never
//! across a wait.

use std::{
    mem,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, trace};

/// Default capacity in floats: 512Ki interleaved complex samples.
pub const DEFAULT_CAPACITY: usize = 1 << 20;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Chunk rejected, nothing was written.
    #[error("ring full: {requested} samples offered, {free} free")]
    Full { requested: usize, free: usize },

    /// The session ended. No partial data is delivered.
    #[error("ring closed")]
    Closed,

    /// The block can never be satisfied with the current capacity.
    #[error("requested {requested} samples from a ring of capacity {capacity}")]
    RequestTooLarge { requested: usize, capacity: usize },

    #[error("ring capacity must be non-zero")]
    ZeroCapacity,
}

/// What [`RingControl::request_resize`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// New storage is in place.
    Applied,
    /// More samples are buffered than the new capacity holds. The resize is
    /// retried on every insert and removal until it fits.
    Deferred,
    /// Already at that capacity. Any pending resize was cancelled.
    Unchanged,
}

/// Point-in-time view of the ring's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub capacity: usize,
    pub desired_capacity: usize,
    pub buffered: usize,
    pub inserted: u64,
    pub removed: u64,
    pub rejected_chunks: u64,
    pub rejected_samples: u64,
    pub resizes: u64,
    pub closed: bool,
}

impl RingStats {
    pub fn free(&self) -> usize {
        self.capacity - self.buffered
    }

    /// Buffered share of the capacity, in `0.0..=1.0`.
    pub fn fill_ratio(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.buffered as f32 / self.capacity as f32
    }
}

struct RingState {
    storage: Vec<f32>,
    desired_capacity: usize,
    write_pos: usize,
    read_pos: usize,
    free: usize,
    waiting: bool,
    closed: bool,

    /// Storage for a pending resize, allocated by whoever asked for it.
    staged: Option<Vec<f32>>,
    /// Storage swapped out by a resize. Released by the consumer or the
    /// controller so the capture thread never frees memory.
    retired: Option<Vec<f32>>,

    inserted: u64,
    removed: u64,
    rejected_chunks: u64,
    rejected_samples: u64,
    resizes: u64,
}

impl RingState {
    fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0.0; capacity],
            desired_capacity: capacity,
            write_pos: 0,
            read_pos: 0,
            free: capacity,
            waiting: false,
            closed: false,
            staged: None,
            retired: None,
            inserted: 0,
            removed: 0,
            rejected_chunks: 0,
            rejected_samples: 0,
            resizes: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn buffered(&self) -> usize {
        self.capacity() - self.free
    }

    /// Caller checked `samples.len() <= self.free`.
    fn write(&mut self, samples: &[f32]) {
        let capacity = self.capacity();
        let head = samples.len().min(capacity - self.write_pos);
        let (first, rest) = samples.split_at(head);

        self.storage[self.write_pos..self.write_pos + head].copy_from_slice(first);
        self.storage[..rest.len()].copy_from_slice(rest);

        self.write_pos = (self.write_pos + samples.len()) % capacity;
        self.free -= samples.len();
        self.inserted += samples.len() as u64;
    }

    /// Caller checked `dest.len() <= self.buffered()`.
    fn read(&mut self, dest: &mut [f32]) {
        let count = dest.len();
        self.copy_unread(dest);
        self.read_pos = (self.read_pos + count) % self.capacity();
        self.free += count;
        self.removed += count as u64;
    }

    /// Copy the oldest `dest.len()` unread samples without consuming them.
    fn copy_unread(&self, dest: &mut [f32]) {
        let capacity = self.capacity();
        let head = dest.len().min(capacity - self.read_pos);
        let (first, rest) = dest.split_at_mut(head);

        first.copy_from_slice(&self.storage[self.read_pos..self.read_pos + head]);
        rest.copy_from_slice(&self.storage[..rest.len()]);
    }

    /// Swap in the staged storage if everything buffered fits in it.
    ///
    /// Never allocates or frees: the old storage goes to `retired`, and the
    /// swap waits while a previous one is still parked there. Through
    /// [`RingControl::request_resize`] that cannot happen, since it releases
    /// parked storage before staging more.
    fn apply_staged(&mut self) -> bool {
        let buffered = self.buffered();
        let Some(mut next) = self.staged.take() else {
            return false;
        };
        if next.len() < buffered || self.retired.is_some() {
            self.staged = Some(next);
            return false;
        }

        self.copy_unread(&mut next[..buffered]);

        let capacity = next.len();
        self.retired = Some(mem::replace(&mut self.storage, next));
        self.read_pos = 0;
        self.write_pos = buffered % capacity;
        self.free = capacity - buffered;
        self.resizes += 1;
        true
    }

    /// Drop-off point for threads allowed to release memory.
    fn settle(&mut self, released: &mut Vec<Vec<f32>>) {
        released.extend(self.retired.take());
        if self.apply_staged() {
            debug!(capacity = self.capacity(), "ring resized");
            released.extend(self.retired.take());
        }
    }

    fn stats(&self) -> RingStats {
        RingStats {
            capacity: self.capacity(),
            desired_capacity: self.desired_capacity,
            buffered: self.buffered(),
            inserted: self.inserted,
            removed: self.removed,
            rejected_chunks: self.rejected_chunks,
            rejected_samples: self.rejected_samples,
            resizes: self.resizes,
            closed: self.closed,
        }
    }
}

struct Shared {
    state: Mutex<RingState>,
    data_ready: Condvar,
}

impl Shared {
    // state is consistent at every unlock, so a poisoned lock is still usable
    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a ring holding `capacity` floats and split it into its two ends.
pub fn sample_ring(capacity: usize) -> Result<(SampleProducer, SampleConsumer), RingError> {
    if capacity == 0 {
        return Err(RingError::ZeroCapacity);
    }

    let shared = Arc::new(Shared {
        state: Mutex::new(RingState::new(capacity)),
        data_ready: Condvar::new(),
    });
    debug!(capacity, "sample ring created");

    Ok((
        SampleProducer {
            shared: Arc::clone(&shared),
        },
        SampleConsumer { shared },
    ))
}

/// Capture end. Dropping it closes the ring.
pub struct SampleProducer {
    shared: Arc<Shared>,
}

impl SampleProducer {
    /// Append a whole chunk or nothing.
    ///
    /// Never blocks on the consumer and never allocates, so it is safe to call
    /// from a realtime capture callback.
    pub fn insert(&mut self, samples: &[f32]) -> Result<(), RingError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(RingError::Closed);
        }
        if samples.is_empty() {
            return Ok(());
        }

        if state.staged.is_some() && state.apply_staged() {
            trace!(capacity = state.capacity(), "ring resized on insert");
        }

        if samples.len() > state.free {
            state.rejected_chunks += 1;
            state.rejected_samples += samples.len() as u64;
            return Err(RingError::Full {
                requested: samples.len(),
                free: state.free,
            });
        }

        state.write(samples);

        let wake = mem::replace(&mut state.waiting, false);
        drop(state);
        if wake {
            self.shared.data_ready.notify_one();
        }
        Ok(())
    }

    pub fn control(&self) -> RingControl {
        RingControl {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for SampleProducer {
    fn drop(&mut self) {
        self.control().close();
    }
}

/// Processing end.
pub struct SampleConsumer {
    shared: Arc<Shared>,
}

impl SampleConsumer {
    /// Fill `dest` with the next `dest.len()` samples, waiting as long as it
    /// takes.
    ///
    /// Returns [`RingError::Closed`] once the ring is closed and fewer than
    /// `dest.len()` samples remain; `dest` is left untouched in that case.
    pub fn remove_blocking(&mut self, dest: &mut [f32]) -> Result<(), RingError> {
        self.remove(dest, None).map(|_| ())
    }

    /// Like [`remove_blocking`](Self::remove_blocking) but gives up after
    /// `timeout`, returning `Ok(false)`. A zero timeout never waits.
    pub fn remove_timeout(&mut self, dest: &mut [f32], timeout: Duration) -> Result<bool, RingError> {
        self.remove(dest, Some(Instant::now() + timeout))
    }

    fn remove(&mut self, dest: &mut [f32], deadline: Option<Instant>) -> Result<bool, RingError> {
        let count = dest.len();
        if count == 0 {
            return Ok(true);
        }

        // declared before the guard so old storage is freed after unlocking
        let mut released = Vec::new();
        let mut state = self.shared.lock();

        loop {
            state.settle(&mut released);

            if state.buffered() >= count {
                state.read(dest);
                return Ok(true);
            }
            if state.closed {
                return Err(RingError::Closed);
            }
            if count > state.capacity() {
                return Err(RingError::RequestTooLarge {
                    requested: count,
                    capacity: state.capacity(),
                });
            }

            state.waiting = true;
            state = match deadline {
                None => self
                    .shared
                    .data_ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.waiting = false;
                        return Ok(false);
                    }
                    self.shared
                        .data_ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
            state.waiting = false;
        }
    }

    pub fn control(&self) -> RingControl {
        RingControl {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Lifecycle handle for the session controller.
#[derive(Clone)]
pub struct RingControl {
    shared: Arc<Shared>,
}

impl RingControl {
    /// Change the capacity without losing buffered samples.
    ///
    /// The new storage is allocated here, on the caller's thread. It is
    /// swapped in right away if the buffered samples fit, otherwise on the
    /// first insert or removal after enough of them have drained.
    pub fn request_resize(&self, capacity: usize) -> Result<ResizeOutcome, RingError> {
        if capacity == 0 {
            return Err(RingError::ZeroCapacity);
        }

        let mut released = Vec::new();

        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(RingError::Closed);
            }
            if state.capacity() == capacity {
                state.desired_capacity = capacity;
                released.extend(state.staged.take());
                return Ok(ResizeOutcome::Unchanged);
            }
        }

        let staging = vec![0.0; capacity];

        let mut state = self.shared.lock();
        if state.closed {
            return Err(RingError::Closed);
        }
        state.desired_capacity = capacity;
        released.extend(state.staged.replace(staging));
        released.extend(state.retired.take());

        let outcome = if state.apply_staged() {
            released.extend(state.retired.take());
            ResizeOutcome::Applied
        } else {
            ResizeOutcome::Deferred
        };
        debug!(capacity, buffered = state.buffered(), ?outcome, "resize requested");

        // a waiting consumer re-checks its request against the new capacity
        let wake = mem::replace(&mut state.waiting, false);
        drop(state);
        if wake {
            self.shared.data_ready.notify_one();
        }
        Ok(outcome)
    }

    /// End the session and release a blocked consumer.
    ///
    /// Inserts fail from now on. The consumer may still take whole blocks
    /// that were already buffered, then gets [`RingError::Closed`].
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.waiting = false;
        let staged = state.staged.take();
        let retired = state.retired.take();
        drop(state);

        drop((staged, retired));
        self.shared.data_ready.notify_all();
        debug!("sample ring closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn stats(&self) -> RingStats {
        self.shared.lock().stats()
    }
}
