//! Error types for PetalSonic

use thiserror::Error;

/// Window errors reported by [`RingBuffer`](crate::ring_buffer::RingBuffer).
///
/// `CpuOverload` is soft: the reader could not take a consistent snapshot of
/// the time bounds and should simply try again next cycle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("requested window is larger than the buffer contents")]
    TooMuch,

    #[error("could not take a consistent snapshot of the time bounds")]
    CpuOverload,

    #[error("requested window starts slightly before the buffered data")]
    SlightlyBehind,

    #[error("requested window lies entirely before the buffered data")]
    WayBehind,

    #[error("requested window ends slightly after the buffered data")]
    SlightlyAhead,

    #[error("requested window lies entirely after the buffered data")]
    WayAhead,
}

#[derive(Error, Debug)]
pub enum PetalSonicError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Ring buffer error: {0}")]
    RingBuffer(#[from] RingBufferError),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, PetalSonicError>;
