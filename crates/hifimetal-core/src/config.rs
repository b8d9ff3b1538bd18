//! Configuration types for hifimetal.
//!
//! The three groups mirror the sections of a vocoder run file: how audio is
//! framed into mel features, how the two optimizers are driven, and how the
//! conditioning input is perturbed. Components receive the group they need by
//! reference at construction.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Audio framing and mel filterbank configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Sampling rate in Hz.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: i32,

    /// FFT size used for the analysis transform.
    #[serde(default = "default_filter_length")]
    pub filter_length: i32,

    /// Hop between successive analysis frames, in samples.
    #[serde(default = "default_hop_length")]
    pub hop_length: i32,

    /// Analysis window length, in samples.
    #[serde(default = "default_win_length")]
    pub win_length: i32,

    /// Number of mel bands.
    #[serde(default = "default_n_mel_channels")]
    pub n_mel_channels: i32,

    /// Lowest filterbank frequency in Hz.
    #[serde(default)]
    pub mel_fmin: f32,

    /// Highest filterbank frequency in Hz (`None` = Nyquist).
    #[serde(default)]
    pub mel_fmax: Option<f32>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            filter_length: default_filter_length(),
            hop_length: default_hop_length(),
            win_length: default_win_length(),
            n_mel_channels: default_n_mel_channels(),
            mel_fmin: 0.0,
            mel_fmax: None,
        }
    }
}

impl DataConfig {
    /// Number of linear frequency bins produced by the analysis transform.
    #[must_use]
    pub fn n_freqs(&self) -> i32 {
        self.filter_length / 2 + 1
    }

    /// Number of mel frames covering `samples` samples.
    #[must_use]
    pub fn frames_for(&self, samples: i32) -> i32 {
        samples / self.hop_length
    }

    /// Convert a segment length in samples to frames.
    ///
    /// Fails when the segment is not a whole number of hops or covers no frame
    /// at all.
    pub fn segment_frames(&self, segment_size: i32) -> Result<i32> {
        if segment_size <= 0 || segment_size % self.hop_length != 0 {
            return Err(CoreError::Config(format!(
                "segment_size {} must be a positive multiple of hop_length {}",
                segment_size, self.hop_length
            )));
        }
        Ok(segment_size / self.hop_length)
    }

    /// Check framing parameters for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.sampling_rate <= 0 {
            return Err(CoreError::Config("sampling_rate must be positive".into()));
        }
        if self.hop_length <= 0 {
            return Err(CoreError::Config("hop_length must be positive".into()));
        }
        if self.win_length > self.filter_length {
            return Err(CoreError::Config(format!(
                "win_length {} exceeds filter_length {}",
                self.win_length, self.filter_length
            )));
        }
        if self.hop_length > self.filter_length {
            return Err(CoreError::Config(format!(
                "hop_length {} exceeds filter_length {}",
                self.hop_length, self.filter_length
            )));
        }
        if (self.filter_length - self.hop_length) % 2 != 0 {
            return Err(CoreError::Config(
                "filter_length - hop_length must be even for symmetric framing".into(),
            ));
        }
        if self.n_mel_channels <= 0 {
            return Err(CoreError::Config("n_mel_channels must be positive".into()));
        }
        let nyquist = self.sampling_rate as f32 / 2.0;
        let fmax = self.mel_fmax.unwrap_or(nyquist);
        if self.mel_fmin < 0.0 || fmax <= self.mel_fmin || fmax > nyquist {
            return Err(CoreError::Config(format!(
                "mel range [{}, {}] invalid for sampling rate {}",
                self.mel_fmin, fmax, self.sampling_rate
            )));
        }
        Ok(())
    }
}

/// Optimization hyperparameters for the adversarial run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Training segment length in waveform samples.
    #[serde(default = "default_segment_size")]
    pub segment_size: i32,

    /// Generator learning rate.
    #[serde(default = "default_learning_rate")]
    pub generator_learning_rate: f32,

    /// Discriminator learning rate.
    #[serde(default = "default_learning_rate")]
    pub discriminator_learning_rate: f32,

    /// AdamW beta coefficients.
    #[serde(default = "default_betas")]
    pub betas: (f32, f32),

    /// AdamW epsilon.
    #[serde(default = "default_eps")]
    pub eps: f32,

    /// AdamW weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,

    /// Per-epoch exponential learning rate decay factor.
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f64,

    /// Weight of the mel reconstruction term in the generator objective.
    #[serde(default = "default_c_mel")]
    pub c_mel: f32,

    /// Random seed for segment offsets and augmentation.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Number of epochs to train.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Emit training scalars every this many steps.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,

    /// Maximum number of validation examples exported per validation step.
    #[serde(default = "default_max_valid_examples")]
    pub max_valid_examples: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            generator_learning_rate: default_learning_rate(),
            discriminator_learning_rate: default_learning_rate(),
            betas: default_betas(),
            eps: default_eps(),
            weight_decay: default_weight_decay(),
            lr_decay: default_lr_decay(),
            c_mel: default_c_mel(),
            seed: default_seed(),
            epochs: default_epochs(),
            log_interval: default_log_interval(),
            max_valid_examples: default_max_valid_examples(),
        }
    }
}

impl TrainConfig {
    /// Check optimizer settings.
    pub fn validate(&self) -> Result<()> {
        if self.generator_learning_rate <= 0.0 || self.discriminator_learning_rate <= 0.0 {
            return Err(CoreError::Config("learning rates must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.lr_decay) || self.lr_decay == 0.0 {
            return Err(CoreError::Config(format!(
                "lr_decay {} must lie in (0, 1]",
                self.lr_decay
            )));
        }
        if self.c_mel < 0.0 {
            return Err(CoreError::Config("c_mel must be non-negative".into()));
        }
        if self.log_interval == 0 {
            return Err(CoreError::Config("log_interval must be at least 1".into()));
        }
        Ok(())
    }
}

/// Fixed, non-learned perturbations applied to the conditioning waveform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentConfig {
    /// Lower bound of the random gain, in dB.
    #[serde(default = "default_gain_db_min")]
    pub gain_db_min: f32,

    /// Upper bound of the random gain, in dB.
    #[serde(default = "default_gain_db_max")]
    pub gain_db_max: f32,

    /// Standard deviation of additive Gaussian noise.
    #[serde(default = "default_noise_std")]
    pub noise_std: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            gain_db_min: default_gain_db_min(),
            gain_db_max: default_gain_db_max(),
            noise_std: default_noise_std(),
        }
    }
}

impl AugmentConfig {
    /// Configuration that leaves the waveform untouched.
    pub fn identity() -> Self {
        Self {
            gain_db_min: 0.0,
            gain_db_max: 0.0,
            noise_std: 0.0,
        }
    }

    /// Check the gain range and noise level.
    pub fn validate(&self) -> Result<()> {
        if self.gain_db_min > self.gain_db_max {
            return Err(CoreError::Config(format!(
                "gain range [{}, {}] is empty",
                self.gain_db_min, self.gain_db_max
            )));
        }
        if self.noise_std < 0.0 {
            return Err(CoreError::Config("noise_std must be non-negative".into()));
        }
        Ok(())
    }
}

fn default_sampling_rate() -> i32 {
    48000
}
fn default_filter_length() -> i32 {
    2048
}
fn default_hop_length() -> i32 {
    512
}
fn default_win_length() -> i32 {
    2048
}
fn default_n_mel_channels() -> i32 {
    256
}
fn default_segment_size() -> i32 {
    8192
}
fn default_learning_rate() -> f32 {
    2e-4
}
fn default_betas() -> (f32, f32) {
    (0.8, 0.99)
}
fn default_eps() -> f32 {
    1e-9
}
fn default_weight_decay() -> f32 {
    0.01
}
fn default_lr_decay() -> f64 {
    0.999875
}
fn default_c_mel() -> f32 {
    45.0
}
fn default_seed() -> u64 {
    1234
}
fn default_epochs() -> usize {
    100
}
fn default_log_interval() -> usize {
    200
}
fn default_max_valid_examples() -> usize {
    10
}
fn default_gain_db_min() -> f32 {
    -6.0
}
fn default_gain_db_max() -> f32 {
    0.0
}
fn default_noise_std() -> f32 {
    1e-4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_config_defaults() {
        let config = DataConfig::default();
        assert_eq!(config.sampling_rate, 48000);
        assert_eq!(config.hop_length, 512);
        assert_eq!(config.n_freqs(), 1025);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_segment_frames() {
        let config = DataConfig::default();
        assert_eq!(config.segment_frames(8192).unwrap(), 16);
        assert!(config.segment_frames(8000).is_err());
        assert!(config.segment_frames(0).is_err());
    }

    #[test]
    fn test_invalid_mel_range() {
        let config = DataConfig {
            mel_fmax: Some(30000.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_train_config_partial_deserialize() {
        let config: TrainConfig =
            serde_json::from_str(r#"{"segment_size": 4096, "c_mel": 10.0}"#).unwrap();
        assert_eq!(config.segment_size, 4096);
        assert_eq!(config.c_mel, 10.0);
        assert_eq!(config.betas, (0.8, 0.99));
        assert_eq!(config.max_valid_examples, 10);
    }

    #[test]
    fn test_train_config_rejects_bad_decay() {
        let config = TrainConfig {
            lr_decay: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_augment_config_yaml() {
        let config: AugmentConfig = serde_yaml::from_str("gain_db_min: -3.0\n").unwrap();
        assert_eq!(config.gain_db_min, -3.0);
        assert_eq!(config.gain_db_max, 0.0);
        assert!(config.validate().is_ok());
        assert!(AugmentConfig::identity().validate().is_ok());
    }
}
