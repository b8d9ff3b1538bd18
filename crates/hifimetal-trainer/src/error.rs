//! Error types for the trainer crate.

use mlx_rs::error::Exception;
use thiserror::Error;

/// Result type for trainer operations.
pub type Result<T> = std::result::Result<T, TrainerError>;

/// Which half of an adversarial step was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Discriminator update against a detached generator output.
    Discriminator,
    /// Generator update against the (just updated) discriminators.
    Generator,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Discriminator => write!(f, "discriminator"),
            Phase::Generator => write!(f, "generator"),
        }
    }
}

/// Error type for trainer operations.
#[derive(Error, Debug)]
pub enum TrainerError {
    /// Model, feature or loss error.
    #[error(transparent)]
    Vocoder(#[from] hifimetal_vocoder::VocoderError),

    /// Configuration or sink error from the core crate.
    #[error(transparent)]
    Core(#[from] hifimetal_core::CoreError),

    /// MLX error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint could not be written or read.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// A segment does not fit in the physical tensor.
    #[error("Segment of {segment} frames at offset {offset} exceeds {available} available frames")]
    SegmentBounds {
        /// Requested start frame.
        offset: i32,
        /// Segment length in frames.
        segment: i32,
        /// Frames physically present.
        available: i32,
    },

    /// Invalid run configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A training step was abandoned before any update of the failing phase.
    #[error("Step aborted in {phase} phase: {reason}")]
    StepAborted {
        /// Phase that failed.
        phase: Phase,
        /// What went wrong.
        reason: String,
    },
}

impl From<serde_json::Error> for TrainerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for TrainerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}
