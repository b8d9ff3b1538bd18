//! Common type definitions.

use serde::{Deserialize, Serialize};

/// A two-dimensional spectrogram snapshot prepared for a metric sink.
///
/// Stored row-major with `height` mel bands and `width` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrogramImage {
    /// Row-major values.
    pub data: Vec<f32>,
    /// Number of rows (mel bands).
    pub height: usize,
    /// Number of columns (frames).
    pub width: usize,
}

impl SpectrogramImage {
    /// Wrap a row-major buffer, checking its size.
    pub fn new(data: Vec<f32>, height: usize, width: usize) -> Option<Self> {
        (data.len() == height * width).then_some(Self {
            data,
            height,
            width,
        })
    }

    /// Minimum and maximum value, `None` for an empty image.
    #[must_use]
    pub fn value_range(&self) -> Option<(f32, f32)> {
        let mut iter = self.data.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }
}

/// Scalar summary of a validation or training phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Epoch index.
    pub epoch: usize,
    /// Optimizer steps taken so far.
    pub global_step: usize,
    /// Mean discriminator loss over the epoch.
    pub discriminator_loss: f64,
    /// Mean generator loss over the epoch.
    pub generator_loss: f64,
    /// Reduced validation mel loss, if validation ran.
    pub validation_mel_loss: Option<f64>,
    /// Steps skipped because the discriminator phase aborted.
    pub aborted_steps: usize,
}
