//! Mel-conditioned waveform generator.
//!
//! The generator converts mel spectrograms to audio with a stack of
//! transposed-convolution upsampling stages. After each stage, a bank of
//! residual blocks with different kernel sizes runs in parallel and their
//! outputs are averaged (multi-receptive-field fusion).

use crate::config::GeneratorConfig;
use crate::error::{Result, VocoderError};
use crate::nn::{ResBlock, WeightNormConv1d, WeightNormConvTranspose1d, LRELU_SLOPE};
use mlx_rs::{
    macros::ModuleParameters,
    module::{ModuleParameters, ModuleParametersExt},
    Array,
};
use std::path::Path;

/// Slope of the activation before the output convolution.
const POST_LRELU_SLOPE: f32 = 0.01;

/// HiFi-GAN generator.
///
/// Converts mel spectrograms `[batch, n_mels, frames]` to waveforms
/// `[batch, 1, frames * hop]`.
#[derive(Debug, ModuleParameters)]
pub struct Generator {
    pub config: GeneratorConfig,
    #[param]
    pub conv_pre: WeightNormConv1d,
    #[param]
    pub ups: Vec<WeightNormConvTranspose1d>,
    /// Residual blocks, `num_kernels` per upsampling stage, stage-major.
    #[param]
    pub resblocks: Vec<ResBlock>,
    #[param]
    pub conv_post: WeightNormConv1d,
}

impl Generator {
    /// Create a new generator from configuration.
    ///
    /// # Errors
    /// [`VocoderError::Config`] when the layer lists are inconsistent.
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        config.validate_architecture()?;
        let num_kernels = config.resblock_kernel_sizes.len();

        let conv_pre = WeightNormConv1d::new(
            config.num_mels,
            config.upsample_initial_channel,
            7,
            Some(1),
            Some(3),
            None,
            None,
        )?;

        let mut ups = Vec::with_capacity(config.upsample_rates.len());
        let mut resblocks = Vec::with_capacity(config.upsample_rates.len() * num_kernels);
        let mut channels = config.upsample_initial_channel;

        for (&rate, &kernel) in config
            .upsample_rates
            .iter()
            .zip(&config.upsample_kernel_sizes)
        {
            let out_channels = channels / 2;
            ups.push(WeightNormConvTranspose1d::new(
                channels,
                out_channels,
                kernel,
                rate,
                (kernel - rate) / 2,
            )?);

            for (k, dilations) in config
                .resblock_kernel_sizes
                .iter()
                .zip(&config.resblock_dilation_sizes)
            {
                resblocks.push(ResBlock::new(out_channels, *k, dilations)?);
            }
            channels = out_channels;
        }

        let conv_post = WeightNormConv1d::new(channels, 1, 7, Some(1), Some(3), None, None)?;

        Ok(Self {
            config: config.clone(),
            conv_pre,
            ups,
            resblocks,
            conv_post,
        })
    }

    /// Create a generator after checking it against the feature hop length.
    pub fn for_hop(config: &GeneratorConfig, hop_length: i32) -> Result<Self> {
        config.validate(hop_length)?;
        Self::new(config)
    }

    /// Samples produced per input frame.
    pub fn hop_length(&self) -> i32 {
        self.config.upsample_factor()
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `mel` - Mel spectrogram `[batch, n_mels, frames]`
    ///
    /// # Returns
    /// Waveform in `[-1, 1]`, shape `[batch, 1, frames * hop]`
    pub fn forward(&self, mel: &Array) -> Result<Array> {
        if mel.ndim() != 3 || mel.dim(1) != self.config.num_mels {
            return Err(VocoderError::ShapeMismatch {
                expected: vec![-1, self.config.num_mels, -1],
                actual: mel.shape().to_vec(),
            });
        }

        let num_kernels = self.config.resblock_kernel_sizes.len();
        let scale = Array::from_f32(1.0 / num_kernels as f32);

        let mut x = self.conv_pre.forward(mel)?;
        for (i, up) in self.ups.iter().enumerate() {
            x = mlx_rs::nn::leaky_relu(&x, LRELU_SLOPE)?;
            x = up.forward(&x)?;

            let stage = &self.resblocks[i * num_kernels..(i + 1) * num_kernels];
            let mut fused = stage[0].forward(&x)?;
            for block in &stage[1..] {
                fused = fused.add(&block.forward(&x)?)?;
            }
            x = fused.multiply(&scale)?;
        }

        let x = mlx_rs::nn::leaky_relu(&x, POST_LRELU_SLOPE)?;
        let x = self.conv_post.forward(&x)?;
        Ok(mlx_rs::ops::tanh(&x)?)
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.parameters()
            .flatten()
            .values()
            .map(|p| p.size())
            .sum()
    }

    /// Load weights from a safetensors file written by the checkpoint manager
    /// or converted from another framework with matching names.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        self.load_safetensors(path)
            .map_err(|e| VocoderError::WeightLoad(format!("{:?}: {}", path, e)))?;
        tracing::info!(path = ?path, "Loaded generator weights");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_output_length() {
        let config = GeneratorConfig::tiny(16);
        let generator = Generator::for_hop(&config, 64).unwrap();
        let mel = mlx_rs::random::normal::<f32>(&[2, 16, 5], None, None, None).unwrap();
        let audio = generator.forward(&mel).unwrap();
        assert_eq!(audio.shape(), &[2, 1, 320]);
    }

    #[test]
    fn test_generator_output_bounded() {
        let generator = Generator::new(&GeneratorConfig::tiny(8)).unwrap();
        let mel = mlx_rs::random::normal::<f32>(&[1, 8, 4], None, None, None).unwrap();
        let audio = generator.forward(&mel).unwrap();
        let peak = audio.abs().unwrap().max(None).unwrap();
        peak.eval().unwrap();
        assert!(peak.item::<f32>() <= 1.0);
    }

    #[test]
    fn test_generator_rejects_wrong_mel_bins() {
        let generator = Generator::new(&GeneratorConfig::tiny(8)).unwrap();
        let mel = mlx_rs::ops::zeros::<f32>(&[1, 10, 4]).unwrap();
        assert!(matches!(
            generator.forward(&mel),
            Err(VocoderError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_new_rejects_empty_resblocks() {
        let config = GeneratorConfig {
            resblock_kernel_sizes: vec![],
            resblock_dilation_sizes: vec![],
            ..GeneratorConfig::tiny(8)
        };
        assert!(matches!(
            Generator::new(&config),
            Err(VocoderError::Config(_))
        ));

        let config = GeneratorConfig {
            upsample_rates: vec![4, 4],
            ..GeneratorConfig::tiny(8)
        };
        assert!(Generator::new(&config).is_err());
    }

    #[test]
    fn test_for_hop_rejects_mismatch() {
        assert!(Generator::for_hop(&GeneratorConfig::tiny(8), 256).is_err());
    }

    #[test]
    fn test_parameter_keys() {
        let generator = Generator::new(&GeneratorConfig::tiny(8)).unwrap();
        let params = generator.parameters().flatten();
        assert!(params.contains_key("conv_pre.weight_v"));
        assert!(params.contains_key("ups.2.weight_g"));
        // 3 stages x 2 kernels
        assert!(params.contains_key("resblocks.5.convs1.0.weight_v"));
        assert!(!params.contains_key("resblocks.6.convs1.0.weight_v"));
        assert!(generator.num_parameters() > 0);
    }

    #[test]
    fn test_load_weights_restores_parameters() {
        let source = Generator::new(&GeneratorConfig::tiny(8)).unwrap();
        let mut target = Generator::new(&GeneratorConfig::tiny(8)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generator.safetensors");
        let weights: std::collections::HashMap<std::rc::Rc<str>, Array> = source
            .parameters()
            .flatten()
            .into_iter()
            .map(|(k, v)| (k, v.clone()))
            .collect();
        Array::save_safetensors(weights, None, &path).unwrap();

        target.load_weights(&path).unwrap();
        let expected = source.parameters().flatten();
        let loaded = target.parameters().flatten();
        let diff = expected["conv_pre.weight_v"]
            .subtract(loaded["conv_pre.weight_v"])
            .unwrap()
            .abs()
            .unwrap()
            .max(None)
            .unwrap();
        diff.eval().unwrap();
        assert_eq!(diff.item::<f32>(), 0.0);
    }

    #[test]
    fn test_load_weights_missing_file() {
        let mut generator = Generator::new(&GeneratorConfig::tiny(8)).unwrap();
        let err = generator
            .load_weights(Path::new("/nonexistent/generator.safetensors"))
            .unwrap_err();
        assert!(matches!(err, VocoderError::WeightLoad(_)));
    }
}
