//! Frozen waveform-to-mel feature pipeline.
//!
//! The pipeline is a pure function of its configuration: the analysis window and the
//! mel filterbank are computed once at construction and held as plain arrays,
//! never as module parameters, so no optimizer can reach them. The only state
//! that changes between calls is the augmentation RNG.

use crate::audio::{log_compress, mel_filterbank, MelConfig, Stft, StftConfig};
use crate::error::{Result, VocoderError};
use hifimetal_core::{AugmentConfig, DataConfig};
use mlx_rs::Array;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Waveform to log-mel feature extractor with optional augmentation.
#[derive(Debug)]
pub struct FeaturePipeline {
    data: DataConfig,
    augment: AugmentConfig,
    stft: Stft,
    filterbank: Array,
    rng: StdRng,
    frozen: bool,
}

impl FeaturePipeline {
    /// Build the pipeline and freeze its constants.
    pub fn new(data: &DataConfig, augment: &AugmentConfig, seed: u64) -> Result<Self> {
        data.validate()?;
        augment.validate()?;

        let stft = Stft::new(StftConfig::from(data))?;
        let filterbank = mel_filterbank(&MelConfig::from(data))?;
        filterbank.eval()?;

        tracing::debug!(
            n_fft = data.filter_length,
            hop = data.hop_length,
            n_mels = data.n_mel_channels,
            "Feature pipeline frozen"
        );

        Ok(Self {
            data: data.clone(),
            augment: augment.clone(),
            stft,
            filterbank,
            rng: StdRng::seed_from_u64(seed),
            frozen: true,
        })
    }

    /// Whether the pipeline constants are excluded from optimization.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn data_config(&self) -> &DataConfig {
        &self.data
    }

    pub fn hop_length(&self) -> i32 {
        self.data.hop_length
    }

    pub fn filterbank(&self) -> &Array {
        &self.filterbank
    }

    /// Extract a log-mel spectrogram.
    ///
    /// # Arguments
    /// * `waveform` - Audio `[batch, samples]` or `[batch, 1, samples]`
    /// * `augment` - Apply random gain and additive noise first
    ///
    /// # Returns
    /// Log-mel spectrogram `[batch, n_mels, samples / hop]`
    ///
    /// # Errors
    /// [`VocoderError::ShapeMismatch`] if the input is shorter than one
    /// analysis window.
    pub fn extract(&mut self, waveform: &Array, augment: bool) -> Result<Array> {
        let signal = self.flatten_input(waveform)?;
        let signal = if augment {
            self.augment_waveform(&signal)?
        } else {
            signal
        };
        self.mel_from_signal(&signal)
    }

    /// Deterministic log-mel spectrogram; differentiable with respect to `waveform`.
    pub fn mel(&self, waveform: &Array) -> Result<Array> {
        let signal = self.flatten_input(waveform)?;
        self.mel_from_signal(&signal)
    }

    /// Conditioning features for the generator: extracted, then cut from the graph.
    pub fn conditioning_mel(&mut self, waveform: &Array, augment: bool) -> Result<Array> {
        let mel = self.extract(waveform, augment)?;
        Ok(mlx_rs::stop_gradient(&mel)?)
    }

    /// Linear magnitude spectrogram `[batch, n_freqs, frames]`.
    pub fn spectrogram(&self, waveform: &Array) -> Result<Array> {
        let signal = self.flatten_input(waveform)?;
        self.stft.magnitude(&signal)
    }

    /// Log-mel features from a linear magnitude spectrogram.
    pub fn spec_to_mel(&self, spec: &Array) -> Result<Array> {
        let expected = self.data.n_freqs();
        if spec.ndim() != 3 || spec.dim(1) != expected {
            return Err(VocoderError::ShapeMismatch {
                expected: vec![spec.dim(0), expected, -1],
                actual: spec.shape().to_vec(),
            });
        }
        let mel = crate::audio::spec_to_mel(spec, &self.filterbank)?;
        log_compress(&mel, None)
    }

    /// Apply per-example random gain and additive Gaussian noise to `[batch, samples]`.
    pub fn augment_waveform(&mut self, signal: &Array) -> Result<Array> {
        let batch = signal.dim(0);
        let (lo, hi) = (self.augment.gain_db_min, self.augment.gain_db_max);

        let gains: Vec<f32> = (0..batch)
            .map(|_| {
                let db = if hi > lo { self.rng.gen_range(lo..=hi) } else { lo };
                10f32.powf(db / 20.0)
            })
            .collect();
        let gains = Array::from_slice(&gains, &[batch, 1]);
        let mut out = signal.multiply(&gains)?;

        if self.augment.noise_std > 0.0 {
            let key = mlx_rs::random::key(self.rng.gen::<u64>())?;
            let noise = mlx_rs::random::normal::<f32>(signal.shape(), None, None, Some(&key))?;
            let noise = noise.multiply(&Array::from_f32(self.augment.noise_std))?;
            out = out.add(&noise)?;
        }
        Ok(out)
    }

    fn mel_from_signal(&self, signal: &Array) -> Result<Array> {
        let spec = self.stft.magnitude(signal)?;
        let mel = crate::audio::spec_to_mel(&spec, &self.filterbank)?;
        log_compress(&mel, None)
    }

    /// Normalize input to `[batch, samples]` and check it covers one window.
    fn flatten_input(&self, waveform: &Array) -> Result<Array> {
        let signal = match waveform.ndim() {
            2 => waveform.clone(),
            3 if waveform.dim(1) == 1 => waveform.squeeze_axes(&[1])?,
            _ => {
                return Err(VocoderError::ShapeMismatch {
                    expected: vec![-1, 1, -1],
                    actual: waveform.shape().to_vec(),
                })
            }
        };

        let samples = signal.dim(1);
        let min_samples = self.data.win_length.max(self.stft.config().frame_pad() + 1);
        if samples < min_samples {
            return Err(VocoderError::ShapeMismatch {
                expected: vec![signal.dim(0), min_samples],
                actual: vec![signal.dim(0), samples],
            });
        }
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_data() -> DataConfig {
        DataConfig {
            sampling_rate: 16000,
            filter_length: 256,
            hop_length: 64,
            win_length: 256,
            n_mel_channels: 16,
            mel_fmin: 0.0,
            mel_fmax: None,
        }
    }

    fn max_abs_diff(a: &Array, b: &Array) -> f32 {
        let d = a.subtract(b).unwrap().abs().unwrap().max(None).unwrap();
        d.eval().unwrap();
        d.item::<f32>()
    }

    #[test]
    fn test_pipeline_is_frozen() {
        let pipeline = FeaturePipeline::new(&small_data(), &AugmentConfig::default(), 0).unwrap();
        assert!(pipeline.is_frozen());
        assert_eq!(pipeline.filterbank().shape(), &[16, 129]);
    }

    #[test]
    fn test_extract_frame_count() {
        let mut pipeline =
            FeaturePipeline::new(&small_data(), &AugmentConfig::default(), 0).unwrap();
        let wav = mlx_rs::random::uniform::<_, f32>(-0.5, 0.5, &[2, 1, 1024], None).unwrap();
        let mel = pipeline.extract(&wav, false).unwrap();
        assert_eq!(mel.shape(), &[2, 16, 16]);
    }

    #[test]
    fn test_short_input_is_shape_mismatch() {
        let mut pipeline =
            FeaturePipeline::new(&small_data(), &AugmentConfig::default(), 0).unwrap();
        let wav = mlx_rs::ops::zeros::<f32>(&[1, 100]).unwrap();
        let err = pipeline.extract(&wav, false).unwrap_err();
        assert!(matches!(err, VocoderError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_rejects_multichannel_input() {
        let pipeline = FeaturePipeline::new(&small_data(), &AugmentConfig::default(), 0).unwrap();
        let wav = mlx_rs::ops::zeros::<f32>(&[1, 2, 1024]).unwrap();
        assert!(pipeline.mel(&wav).is_err());
    }

    #[test]
    fn test_no_augment_is_deterministic() {
        let mut pipeline =
            FeaturePipeline::new(&small_data(), &AugmentConfig::default(), 0).unwrap();
        let wav = mlx_rs::random::uniform::<_, f32>(-0.5, 0.5, &[1, 1024], None).unwrap();
        let a = pipeline.extract(&wav, false).unwrap();
        let b = pipeline.extract(&wav, false).unwrap();
        assert_eq!(max_abs_diff(&a, &b), 0.0);
    }

    #[test]
    fn test_augment_perturbs_features() {
        let augment = AugmentConfig {
            gain_db_min: -6.0,
            gain_db_max: -3.0,
            noise_std: 0.01,
        };
        let mut pipeline = FeaturePipeline::new(&small_data(), &augment, 7).unwrap();
        let wav = mlx_rs::random::uniform::<_, f32>(-0.5, 0.5, &[1, 1024], None).unwrap();
        let clean = pipeline.extract(&wav, false).unwrap();
        let noisy = pipeline.extract(&wav, true).unwrap();
        assert!(max_abs_diff(&clean, &noisy) > 1e-3);
    }

    #[test]
    fn test_identity_augment_matches_clean() {
        let mut pipeline =
            FeaturePipeline::new(&small_data(), &AugmentConfig::identity(), 3).unwrap();
        let wav = mlx_rs::random::uniform::<_, f32>(-0.5, 0.5, &[1, 1024], None).unwrap();
        let clean = pipeline.extract(&wav, false).unwrap();
        let augmented = pipeline.extract(&wav, true).unwrap();
        assert!(max_abs_diff(&clean, &augmented) < 1e-6);
    }

    #[test]
    fn test_spectrogram_path_matches_mel() {
        let pipeline = FeaturePipeline::new(&small_data(), &AugmentConfig::default(), 0).unwrap();
        let wav = mlx_rs::random::uniform::<_, f32>(-0.5, 0.5, &[2, 1, 768], None).unwrap();
        let direct = pipeline.mel(&wav).unwrap();
        let spec = pipeline.spectrogram(&wav).unwrap();
        assert_eq!(spec.shape(), &[2, 129, 12]);
        let via_spec = pipeline.spec_to_mel(&spec).unwrap();
        assert!(max_abs_diff(&direct, &via_spec) < 1e-5);
    }

    #[test]
    fn test_spec_to_mel_checks_bins() {
        let pipeline = FeaturePipeline::new(&small_data(), &AugmentConfig::default(), 0).unwrap();
        let spec = mlx_rs::ops::zeros::<f32>(&[1, 100, 4]).unwrap();
        assert!(pipeline.spec_to_mel(&spec).is_err());
    }
}
