//! Decoder error types with granular categories.
//!
//! Queue overflow is deliberately not represented here: it is a recoverable
//! condition that is flagged, logged once per channel-frame, and decoded
//! through with degraded accuracy.

use thiserror::Error;

/// Top-level error type for all decoder operations.
#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),
}

/// Configuration errors, reported synchronously at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid beam: {beam} (must be > 0)")]
    InvalidBeam { beam: f32 },

    #[error("Invalid lattice beam: {lattice_beam} (must be >= 0)")]
    InvalidLatticeBeam { lattice_beam: f32 },

    #[error("Invalid max_active: {max_active} (must be > 1)")]
    InvalidMaxActive { max_active: usize },

    #[error("Invalid token capacity for {field}: {value} (must be > 0)")]
    InvalidTokenCapacity { field: &'static str, value: usize },

    #[error("Invalid lane count: {nlanes} (must be in 1..={max})")]
    InvalidLaneCount { nlanes: usize, max: usize },

    #[error("Channel count {nchannels} is below lane count {nlanes}")]
    ChannelsBelowLanes { nchannels: usize, nlanes: usize },
}

/// API misuse, surfaced as failed results.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("Channel {channel} out of range (decoder has {nchannels} channels)")]
    InvalidChannel { channel: usize, nchannels: usize },

    #[error("Channel {channel} cannot {operation} while {phase}")]
    InvalidTransition {
        channel: usize,
        operation: &'static str,
        phase: &'static str,
    },

    #[error("Channel {channel} scheduled on two lanes in one batch")]
    DuplicateChannel { channel: usize },

    #[error("Batch of {requested} channels exceeds the {nlanes} available lanes")]
    BatchTooLarge { requested: usize, nlanes: usize },

    #[error("Batch shape mismatch: {channels} channels but {decodables} decodables")]
    MismatchedBatch { channels: usize, decodables: usize },
}

/// Result type alias for decoder operations.
pub type Result<T> = std::result::Result<T, DecoderError>;
