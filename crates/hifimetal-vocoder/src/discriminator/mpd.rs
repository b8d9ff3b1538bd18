//! Multi-Period Discriminator (MPD).
//!
//! A period discriminator folds the waveform `[B, 1, T]` into a `T/p x p`
//! grid and convolves along time within each of the `p` phase columns, i.e.
//! a 2D convolution with `(k, 1)` kernels. Here each column becomes its own
//! batch row, `[B * p, 1, T/p]`, and the `(k, 1)` kernels become 1D kernels.

use super::{Discriminator, DiscriminatorOutput};
use crate::config::DiscriminatorConfig;
use crate::error::Result;
use crate::nn::{WeightNormConv1d, LRELU_SLOPE};
use mlx_rs::{macros::ModuleParameters, Array};

/// Multi-Period Discriminator.
#[derive(Debug, ModuleParameters)]
pub struct MultiPeriodDiscriminator {
    /// Individual period discriminators.
    #[param]
    pub discriminators: Vec<PeriodDiscriminator>,
}

impl MultiPeriodDiscriminator {
    /// Create an MPD with the configured periods and widths.
    pub fn new(config: &DiscriminatorConfig) -> Result<Self> {
        let discriminators = config
            .periods
            .iter()
            .map(|&p| PeriodDiscriminator::new(p, &config.period_channels))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { discriminators })
    }

    pub fn periods(&self) -> Vec<i32> {
        self.discriminators.iter().map(|d| d.period).collect()
    }
}

impl Discriminator for MultiPeriodDiscriminator {
    fn forward(&self, audio: &Array) -> Result<Vec<DiscriminatorOutput>> {
        self.discriminators
            .iter()
            .map(|d| d.forward(audio))
            .collect()
    }
}

/// Single period discriminator.
#[derive(Debug, ModuleParameters)]
pub struct PeriodDiscriminator {
    pub period: i32,
    #[param]
    pub convs: Vec<WeightNormConv1d>,
    #[param]
    pub conv_post: WeightNormConv1d,
}

impl PeriodDiscriminator {
    /// Create a new period discriminator.
    ///
    /// # Arguments
    /// * `period` - Folding period
    /// * `channels` - Output widths of the five convolutions
    pub fn new(period: i32, channels: &[i32]) -> Result<Self> {
        let mut convs = Vec::with_capacity(channels.len());
        let mut in_ch = 1;
        let last = channels.len().saturating_sub(1);
        for (i, &out_ch) in channels.iter().enumerate() {
            // stride 3 everywhere except the last layer
            let stride = if i < last { 3 } else { 1 };
            convs.push(WeightNormConv1d::new(
                in_ch,
                out_ch,
                5,
                Some(stride),
                Some(2),
                None,
                None,
            )?);
            in_ch = out_ch;
        }

        let conv_post = WeightNormConv1d::new(in_ch, 1, 3, Some(1), Some(1), None, None)?;

        Ok(Self {
            period,
            convs,
            conv_post,
        })
    }

    /// Fold `[B, 1, T]` into `[B * p, 1, ceil(T / p)]`, reflect-padding the tail.
    fn fold(&self, audio: &Array) -> Result<Array> {
        let batch = audio.dim(0);
        let samples = audio.dim(2);

        let remainder = samples % self.period;
        let x = if remainder != 0 {
            let pad = self.period - remainder;
            let x = audio.reshape(&[batch, samples])?;
            let x = crate::audio::pad_signal(&x, 0, pad, crate::audio::PadMode::Reflect)?;
            x.reshape(&[batch, 1, samples + pad])?
        } else {
            audio.clone()
        };

        let rows = x.dim(2) / self.period;
        // [B, 1, T] -> [B, T/p, p] -> [B, p, T/p] -> [B*p, 1, T/p]
        let x = x.reshape(&[batch, rows, self.period])?;
        let x = x.transpose_axes(&[0, 2, 1])?;
        Ok(x.reshape(&[batch * self.period, 1, rows])?)
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `audio` - Audio waveform [batch, 1, samples]
    ///
    /// # Returns
    /// Discriminator output with logits and feature maps
    pub fn forward(&self, audio: &Array) -> Result<DiscriminatorOutput> {
        let mut x = self.fold(audio)?;
        let mut features = Vec::with_capacity(self.convs.len() + 1);

        for conv in &self.convs {
            x = conv.forward(&x)?;
            x = mlx_rs::nn::leaky_relu(&x, LRELU_SLOPE)?;
            features.push(x.clone());
        }

        let x = self.conv_post.forward(&x)?;
        features.push(x.clone());

        let logits = x.reshape(&[audio.dim(0), -1])?;
        Ok(DiscriminatorOutput { logits, features })
    }
}
