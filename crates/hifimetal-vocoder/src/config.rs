//! Generator and discriminator configuration.

use crate::error::{Result, VocoderError};
use serde::{Deserialize, Serialize};

/// HiFi-GAN generator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Number of mel frequency bins at the input.
    #[serde(default = "default_num_mels")]
    pub num_mels: i32,

    /// Upsampling rates for each stage.
    /// Product must equal the feature hop length (e.g., [8,8,4,2] = 512).
    #[serde(default = "default_upsample_rates")]
    pub upsample_rates: Vec<i32>,

    /// Kernel sizes for the transposed convolutions.
    #[serde(default = "default_upsample_kernel_sizes")]
    pub upsample_kernel_sizes: Vec<i32>,

    /// Channel width after the input convolution; halved at every stage.
    #[serde(default = "default_upsample_initial_channel")]
    pub upsample_initial_channel: i32,

    /// Kernel sizes of the parallel residual blocks.
    #[serde(default = "default_resblock_kernel_sizes")]
    pub resblock_kernel_sizes: Vec<i32>,

    /// Dilations for each residual block.
    #[serde(default = "default_resblock_dilation_sizes")]
    pub resblock_dilation_sizes: Vec<Vec<i32>>,
}

fn default_num_mels() -> i32 {
    256
}
fn default_upsample_rates() -> Vec<i32> {
    vec![8, 8, 4, 2]
}
fn default_upsample_kernel_sizes() -> Vec<i32> {
    vec![16, 16, 8, 4]
}
fn default_upsample_initial_channel() -> i32 {
    512
}
fn default_resblock_kernel_sizes() -> Vec<i32> {
    vec![3, 7, 11]
}
fn default_resblock_dilation_sizes() -> Vec<Vec<i32>> {
    vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]]
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self::v1_48khz()
    }
}

impl GeneratorConfig {
    /// V1-sized generator for 48kHz audio, 256 mel bands, hop 512.
    pub fn v1_48khz() -> Self {
        Self {
            num_mels: 256,
            upsample_rates: vec![8, 8, 4, 2],
            upsample_kernel_sizes: vec![16, 16, 8, 4],
            upsample_initial_channel: 512,
            resblock_kernel_sizes: vec![3, 7, 11],
            resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]],
        }
    }

    /// V1-sized generator for 22.05kHz audio, 80 mel bands, hop 256.
    pub fn v1_22khz() -> Self {
        Self {
            num_mels: 80,
            upsample_rates: vec![8, 8, 2, 2],
            upsample_kernel_sizes: vec![16, 16, 4, 4],
            ..Self::v1_48khz()
        }
    }

    /// Narrow generator for tests and smoke runs: hop 64.
    pub fn tiny(num_mels: i32) -> Self {
        Self {
            num_mels,
            upsample_rates: vec![4, 4, 4],
            upsample_kernel_sizes: vec![8, 8, 8],
            upsample_initial_channel: 32,
            resblock_kernel_sizes: vec![3, 5],
            resblock_dilation_sizes: vec![vec![1, 3], vec![1, 3]],
        }
    }

    /// Total upsampling factor (samples per mel frame).
    pub fn upsample_factor(&self) -> i32 {
        self.upsample_rates.iter().product()
    }

    /// Check internal consistency and agreement with the feature hop.
    pub fn validate(&self, hop_length: i32) -> Result<()> {
        self.validate_architecture()?;
        if self.upsample_factor() != hop_length {
            return Err(VocoderError::Config(format!(
                "upsample factor {} does not match hop_length {}",
                self.upsample_factor(),
                hop_length
            )));
        }
        Ok(())
    }

    /// Check that the layer lists describe a buildable network.
    pub fn validate_architecture(&self) -> Result<()> {
        if self.upsample_rates.is_empty() {
            return Err(VocoderError::Config("at least one upsample stage is required".into()));
        }
        if self.upsample_rates.len() != self.upsample_kernel_sizes.len() {
            return Err(VocoderError::Config(format!(
                "{} upsample rates but {} kernel sizes",
                self.upsample_rates.len(),
                self.upsample_kernel_sizes.len()
            )));
        }
        if self.resblock_kernel_sizes.len() != self.resblock_dilation_sizes.len() {
            return Err(VocoderError::Config(
                "resblock kernel and dilation lists differ in length".into(),
            ));
        }
        if self.resblock_kernel_sizes.is_empty() {
            return Err(VocoderError::Config("at least one resblock is required".into()));
        }
        for (rate, kernel) in self.upsample_rates.iter().zip(&self.upsample_kernel_sizes) {
            if *rate <= 0 || kernel < rate || (kernel - rate) % 2 != 0 {
                return Err(VocoderError::Config(format!(
                    "upsample kernel {} incompatible with rate {}",
                    kernel, rate
                )));
            }
        }
        let stages = self.upsample_rates.len() as u32;
        if self.upsample_initial_channel % 2_i32.pow(stages) != 0 {
            return Err(VocoderError::Config(format!(
                "upsample_initial_channel {} not divisible by 2^{}",
                self.upsample_initial_channel, stages
            )));
        }
        Ok(())
    }
}

/// Discriminator ensemble configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    /// Periods of the period discriminators.
    #[serde(default = "default_periods")]
    pub periods: Vec<i32>,

    /// Output channels of the five strided convolutions in each period discriminator.
    #[serde(default = "default_period_channels")]
    pub period_channels: Vec<i32>,

    /// Number of scale discriminators (each after one more 2x average pooling).
    #[serde(default = "default_num_scales")]
    pub num_scales: usize,

    /// Output channels of the seven convolutions in each scale discriminator.
    #[serde(default = "default_scale_channels")]
    pub scale_channels: Vec<i32>,
}

fn default_periods() -> Vec<i32> {
    vec![2, 3, 5, 7, 11]
}
fn default_period_channels() -> Vec<i32> {
    vec![32, 128, 512, 1024, 1024]
}
fn default_num_scales() -> usize {
    3
}
fn default_scale_channels() -> Vec<i32> {
    vec![128, 128, 256, 512, 1024, 1024, 1024]
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            periods: default_periods(),
            period_channels: default_period_channels(),
            num_scales: default_num_scales(),
            scale_channels: default_scale_channels(),
        }
    }
}

impl DiscriminatorConfig {
    /// Narrow ensemble for tests: same topology, a fraction of the width.
    pub fn tiny() -> Self {
        Self {
            periods: default_periods(),
            period_channels: vec![4, 8, 16, 16, 16],
            num_scales: 3,
            scale_channels: vec![16, 16, 32, 32, 64, 64, 64],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.periods.iter().any(|p| *p < 1) {
            return Err(VocoderError::Config("periods must be positive".into()));
        }
        if self.period_channels.len() != 5 {
            return Err(VocoderError::Config(format!(
                "period discriminators need 5 channel widths, got {}",
                self.period_channels.len()
            )));
        }
        if self.scale_channels.len() != 7 {
            return Err(VocoderError::Config(format!(
                "scale discriminators need 7 channel widths, got {}",
                self.scale_channels.len()
            )));
        }
        // grouped layers need widths divisible by their group count
        for (i, groups) in crate::discriminator::SCALE_GROUPS.iter().enumerate() {
            let in_ch = if i == 0 { 1 } else { self.scale_channels[i - 1] };
            let out_ch = self.scale_channels[i];
            if in_ch % groups != 0 || out_ch % groups != 0 {
                return Err(VocoderError::Config(format!(
                    "scale layer {} ({} -> {}) not divisible into {} groups",
                    i, in_ch, out_ch, groups
                )));
            }
        }
        Ok(())
    }
}

/// Full model configuration: both players.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VocoderConfig {
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub discriminator: DiscriminatorConfig,
}

impl VocoderConfig {
    /// Small configuration for tests: generator hop 64.
    pub fn tiny(num_mels: i32) -> Self {
        Self {
            generator: GeneratorConfig::tiny(num_mels),
            discriminator: DiscriminatorConfig::tiny(),
        }
    }
}
