//! Discriminators for adversarial vocoder training.
//!
//! Two families look at the waveform from complementary angles:
//! - Multi-Period Discriminator (MPD): folds the signal by a period and
//!   convolves along each phase column, capturing periodic structure
//! - Multi-Scale Discriminator (MSD): convolves the raw and average-pooled
//!   signal, capturing structure at several time scales

mod mpd;
mod msd;

pub use mpd::{MultiPeriodDiscriminator, PeriodDiscriminator};
pub use msd::{MultiScaleDiscriminator, ScaleDiscriminator, SCALE_GROUPS};

use crate::config::DiscriminatorConfig;
use crate::error::Result;
use mlx_rs::{macros::ModuleParameters, Array};

/// Output from a single sub-discriminator.
#[derive(Debug, Clone)]
pub struct DiscriminatorOutput {
    /// Final logits (real/fake prediction).
    pub logits: Array,
    /// Intermediate feature maps for feature matching loss.
    pub features: Vec<Array>,
}

/// Scores of one discriminator family on a real and a generated batch.
///
/// All four vectors have one entry per sub-discriminator, in the same order.
#[derive(Debug, Clone)]
pub struct ScoreTuple {
    pub real_scores: Vec<Array>,
    pub generated_scores: Vec<Array>,
    pub real_feature_maps: Vec<Vec<Array>>,
    pub generated_feature_maps: Vec<Vec<Array>>,
}

impl ScoreTuple {
    /// Pair up per-sub-discriminator outputs for real and generated audio.
    pub fn from_outputs(real: Vec<DiscriminatorOutput>, generated: Vec<DiscriminatorOutput>) -> Self {
        let (real_scores, real_feature_maps) =
            real.into_iter().map(|o| (o.logits, o.features)).unzip();
        let (generated_scores, generated_feature_maps) =
            generated.into_iter().map(|o| (o.logits, o.features)).unzip();
        Self {
            real_scores,
            generated_scores,
            real_feature_maps,
            generated_feature_maps,
        }
    }

    /// Number of sub-discriminators.
    pub fn len(&self) -> usize {
        self.real_scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.real_scores.is_empty()
    }
}

/// A family of sub-discriminators scoring waveforms.
pub trait Discriminator {
    /// Score a waveform `[batch, 1, samples]` with every sub-discriminator.
    fn forward(&self, audio: &Array) -> Result<Vec<DiscriminatorOutput>>;

    /// Score a real and a generated batch.
    fn score(&self, real: &Array, generated: &Array) -> Result<ScoreTuple> {
        let real = self.forward(real)?;
        let generated = self.forward(generated)?;
        Ok(ScoreTuple::from_outputs(real, generated))
    }
}

/// Both discriminator families, owned and optimized as one module.
#[derive(Debug, ModuleParameters)]
pub struct DiscriminatorEnsemble {
    #[param]
    pub period: MultiPeriodDiscriminator,
    #[param]
    pub scale: MultiScaleDiscriminator,
}

impl DiscriminatorEnsemble {
    pub fn new(config: &DiscriminatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            period: MultiPeriodDiscriminator::new(config)?,
            scale: MultiScaleDiscriminator::new(config)?,
        })
    }

    /// Score a real and a generated batch with both families.
    ///
    /// # Returns
    /// `(period_scores, scale_scores)`
    pub fn score(&self, real: &Array, generated: &Array) -> Result<(ScoreTuple, ScoreTuple)> {
        Ok((
            self.period.score(real, generated)?,
            self.scale.score(real, generated)?,
        ))
    }
}
