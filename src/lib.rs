//! Bounded, resizable IQ sample ring for SDR capture pipelines, and the
//! session plumbing that drives it from a capture thread to a processing
//! thread.

pub mod monitor;
pub mod ring;
pub mod session;
pub mod source;

pub use ring::{
    sample_ring, ResizeOutcome, RingControl, RingError, RingStats, SampleConsumer, SampleProducer,
    DEFAULT_CAPACITY,
};
