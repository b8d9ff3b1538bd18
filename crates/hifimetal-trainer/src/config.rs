//! Run configuration.
//!
//! One struct groups every setting of an adversarial run. It is loaded once,
//! validated once, and passed by reference to the components that need it.

use std::path::Path;

use hifimetal_core::{AugmentConfig, DataConfig, TrainConfig};
use hifimetal_vocoder::VocoderConfig;
use serde::{Deserialize, Serialize};

use crate::{Result, TrainerError};

/// Complete configuration of a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HifiGanConfig {
    /// Generator and discriminator architecture.
    #[serde(default)]
    pub model: VocoderConfig,
    /// Audio framing and mel analysis.
    #[serde(default)]
    pub data: DataConfig,
    /// Optimization schedule.
    #[serde(default)]
    pub train: TrainConfig,
    /// Conditioning-waveform augmentation.
    #[serde(default)]
    pub augment: AugmentConfig,
}

impl HifiGanConfig {
    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            other => {
                return Err(TrainerError::Config(format!(
                    "unsupported config extension {:?} for {:?}",
                    other, path
                )))
            }
        };
        tracing::debug!(path = ?path, "Loaded run configuration");
        Ok(config)
    }

    /// Small configuration for tests: 16 kHz, hop 64, 16 mel bands, 512-sample
    /// segments, tiny networks.
    pub fn tiny() -> Self {
        let data = DataConfig {
            sampling_rate: 16000,
            filter_length: 256,
            hop_length: 64,
            win_length: 256,
            n_mel_channels: 16,
            mel_fmin: 0.0,
            mel_fmax: None,
        };
        let train = TrainConfig {
            segment_size: 512,
            epochs: 2,
            log_interval: 1,
            max_valid_examples: 2,
            ..TrainConfig::default()
        };
        Self {
            model: VocoderConfig::tiny(data.n_mel_channels),
            data,
            train,
            augment: AugmentConfig::default(),
        }
    }

    /// Segment length in mel frames.
    pub fn segment_frames(&self) -> Result<i32> {
        Ok(self.data.segment_frames(self.train.segment_size)?)
    }

    /// Check every group and the constraints between groups.
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.train.validate()?;
        self.augment.validate()?;
        self.model.discriminator.validate()?;
        self.model.generator.validate(self.data.hop_length)?;

        if self.model.generator.num_mels != self.data.n_mel_channels {
            return Err(TrainerError::Config(format!(
                "generator expects {} mel bands but features have {}",
                self.model.generator.num_mels, self.data.n_mel_channels
            )));
        }

        let frames = self.segment_frames()?;
        // generated segments must cover one analysis window to be re-analyzed
        if self.train.segment_size < self.data.win_length {
            return Err(TrainerError::SegmentBounds {
                offset: 0,
                segment: frames,
                available: self.data.frames_for(self.data.win_length),
            });
        }
        Ok(())
    }

    /// Serialized form stored in checkpoint metadata.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = HifiGanConfig::default();
        config.validate().unwrap();
        assert_eq!(config.segment_frames().unwrap(), 16);
    }

    #[test]
    fn test_tiny_config_is_valid() {
        let config = HifiGanConfig::tiny();
        config.validate().unwrap();
        assert_eq!(config.segment_frames().unwrap(), 8);
    }

    #[test]
    fn test_segment_not_hop_multiple() {
        let mut config = HifiGanConfig::default();
        config.train.segment_size = 8000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_segment_shorter_than_window() {
        let mut config = HifiGanConfig::tiny();
        config.train.segment_size = 128;
        assert!(matches!(
            config.validate(),
            Err(TrainerError::SegmentBounds { .. })
        ));
    }

    #[test]
    fn test_generator_hop_mismatch() {
        let mut config = HifiGanConfig::tiny();
        config.data.hop_length = 128;
        config.train.segment_size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mel_band_mismatch() {
        let mut config = HifiGanConfig::tiny();
        config.model.generator.num_mels = 80;
        assert!(matches!(config.validate(), Err(TrainerError::Config(_))));
    }

    #[test]
    fn test_load_yaml_with_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "train:\n  segment_size: 16384\n  c_mel: 30.0").unwrap();

        let config = HifiGanConfig::from_file(file.path()).unwrap();
        assert_eq!(config.train.segment_size, 16384);
        assert_eq!(config.train.c_mel, 30.0);
        assert_eq!(config.data.hop_length, 512);
        config.validate().unwrap();
    }

    #[test]
    fn test_json_roundtrip_through_file() {
        let config = HifiGanConfig::tiny();
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{}", config.to_json().unwrap()).unwrap();

        let loaded = HifiGanConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        assert!(HifiGanConfig::from_file(file.path()).is_err());
    }
}
