//! sf-dsp: Signal processing blocks for the Soundfield engine
//!
//! Block-oriented DSP with fixed block sizes (a positive multiple of 8,
//! chosen once per process lifetime):
//! - uniformly partitioned frequency-domain convolution with queued filter
//!   swap and crossfade support (`conv`)
//! - non-causal block delay line for wave-field synthesis
//! - per-output channel combining with equal-power crossfades
//! - biquad cascades with near-field-compensation coefficient design

pub mod biquad;
pub mod combine;
pub mod conv;
pub mod delayline;
pub mod nfc;

use thiserror::Error;

/// DSP configuration error.
#[derive(Error, Debug)]
pub enum DspError {
    /// The convolver requires block sizes that are a multiple of 8
    #[error("Invalid block size: {0} (must be a positive multiple of 8)")]
    InvalidBlockSize(usize),

    /// Partition counts or block sizes of connected stages do not match
    #[error("Size mismatch: {context} (expected {expected}, got {got})")]
    SizeMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },
}

pub type DspResult<T> = Result<T, DspError>;
