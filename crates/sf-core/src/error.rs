//! Error types shared across the engine

use thiserror::Error;

/// Configuration error raised while constructing engine components.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required parameter is not present
    #[error("Missing parameter: {0}")]
    Missing(String),

    /// A parameter value could not be parsed or is out of range
    #[error("Invalid value for parameter {key}: {value}")]
    Invalid { key: String, value: String },

    /// Block size must be a positive multiple of 8
    #[error("Invalid block size: {0} (must be a positive multiple of 8)")]
    InvalidBlockSize(usize),

    /// Sample rate of external data does not match the engine
    #[error("Sample rate mismatch: engine runs at {expected} Hz, got {got} Hz")]
    SampleRateMismatch { expected: u32, got: u32 },

    /// Channel count of external data does not fit the reproduction setup
    #[error("Channel count mismatch: expected {expected}, got {got}")]
    ChannelCountMismatch { expected: usize, got: usize },
}

/// Result type alias for configuration
pub type ConfigResult<T> = Result<T, ConfigError>;
