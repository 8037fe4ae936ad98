//! Error types for the resynthesis engine

use thiserror::Error;

/// Resynthesis engine errors
#[derive(Debug, Error)]
pub enum ResynthError {
    /// Transform length is not a power of two, or is below 2
    #[error("Invalid transform size: {0} (must be a power of two >= 2)")]
    InvalidTransformSize(usize),

    /// Buffer handed to a frame operation has the wrong length
    #[error("Frame size mismatch: expected {expected}, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    /// Phase cursor received a frame out of temporal order
    #[error("Frame out of order: expected frame {expected}, got {actual}")]
    FrameOutOfOrder { expected: u64, actual: u64 },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transform ratio outside the supported range
    #[error("Invalid ratio: {0}")]
    InvalidRatio(f32),

    /// Empty input buffer
    #[error("Input buffer is empty")]
    EmptyInput,

    /// Notes in a voice overlap or are not ordered by start
    #[error("Voice {voice}: note {note} overlaps or precedes the previous note")]
    OverlappingNotes { voice: usize, note: usize },

    /// Interleaved buffer does not match the channel count
    #[error("Invalid channel layout: {samples} samples for {channels} channels")]
    InvalidChannelLayout { samples: usize, channels: usize },

    /// FFT backend error
    #[error("FFT error: {0}")]
    Fft(String),

    /// Configuration (de)serialization failure
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Run cancelled between note segments
    #[error("Resynthesis cancelled")]
    Cancelled,
}

/// Result type for resynthesis operations
pub type ResynthResult<T> = Result<T, ResynthError>;
