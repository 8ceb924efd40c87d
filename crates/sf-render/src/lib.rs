//! sf-render: Spatial audio rendering engine
//!
//! Hosts the concrete rendering algorithms on top of the realtime graph:
//! - binaural synthesis (HRIR convolution with head tracking)
//! - binaural room synthesis (BRS, orientation-switched BRIRs)
//! - wave-field synthesis (WFS) over a loudspeaker array
//! - near-field-compensated higher-order Ambisonics (NFC-HOA)
//! - generic matrix-of-FIRs rendering
//!
//! All renderers share the same shape: a host-driven `audio_callback`, a
//! scene state mutated through lock-free commands, sources carrying their
//! per-output contributions, and outputs combining those contributions
//! with crossfades.

mod base;
mod irfile;
mod setup;

pub mod binaural;
pub mod brs;
pub mod generic;
pub mod hoa;
pub mod wfs;

pub use base::{
    InputItem, Levels, OutputBase, RenderOutput, RenderSource, RendererBase, SceneState,
    SourceBase, SourceParams,
};
pub use irfile::{load_wav, IrData};
pub use setup::{Loudspeaker, LoudspeakerModel, LoudspeakerSetup};

use sf_core::ConfigError;
use sf_dsp::DspError;
use sf_rt::BackendError;
use thiserror::Error;

/// Rendering engine error.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dsp(#[from] DspError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audio file error: {0}")]
    Wav(#[from] hound::Error),

    /// The host delivered a period of the wrong length
    #[error("Host period mismatch: engine block size is {expected}, host delivered {got}")]
    PeriodMismatch { expected: usize, got: usize },

    /// Reproduction setup required before this operation
    #[error("No reproduction setup loaded")]
    NoSetup,

    /// Unknown source id
    #[error("Unknown source: {0}")]
    UnknownSource(u32),

    /// Setup constraint violated by the renderer
    #[error("Unsupported reproduction setup: {0}")]
    UnsupportedSetup(String),
}

pub type RenderResult<T> = Result<T, RenderError>;
