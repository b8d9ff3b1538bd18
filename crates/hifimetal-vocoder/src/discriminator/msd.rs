//! Multi-Scale Discriminator (MSD).
//!
//! Each scale discriminator sees the waveform after one more 2x average
//! pooling than the previous one.

use super::{Discriminator, DiscriminatorOutput};
use crate::config::DiscriminatorConfig;
use crate::error::Result;
use crate::nn::{conv1d_ncl, WeightNormConv1d, LRELU_SLOPE};
use mlx_rs::{macros::ModuleParameters, Array};

/// Group counts of the seven scale-discriminator convolutions.
pub const SCALE_GROUPS: [i32; 7] = [1, 4, 16, 16, 16, 16, 1];

const SCALE_KERNELS: [i32; 7] = [15, 41, 41, 41, 41, 41, 5];
const SCALE_STRIDES: [i32; 7] = [1, 2, 2, 4, 4, 1, 1];
const SCALE_PADDINGS: [i32; 7] = [7, 20, 20, 20, 20, 20, 2];

const POOL_KERNEL: i32 = 4;
const POOL_STRIDE: i32 = 2;
const POOL_PADDING: i32 = 2;

/// Multi-Scale Discriminator.
#[derive(Debug, ModuleParameters)]
pub struct MultiScaleDiscriminator {
    #[param]
    pub discriminators: Vec<ScaleDiscriminator>,
    /// Constant averaging kernel `[1, 1, 4]`, not trained.
    pool_kernel: Array,
}

impl MultiScaleDiscriminator {
    pub fn new(config: &DiscriminatorConfig) -> Result<Self> {
        let discriminators = (0..config.num_scales)
            .map(|_| ScaleDiscriminator::new(&config.scale_channels))
            .collect::<Result<Vec<_>>>()?;

        let weights = vec![1.0 / POOL_KERNEL as f32; POOL_KERNEL as usize];
        let pool_kernel = Array::from_slice(&weights, &[1, 1, POOL_KERNEL]);

        Ok(Self {
            discriminators,
            pool_kernel,
        })
    }

    /// Average pooling (kernel 4, stride 2, padding 2) on `[B, 1, T]`.
    ///
    /// Padded positions count toward the average.
    fn pool(&self, audio: &Array) -> Result<Array> {
        conv1d_ncl(audio, &self.pool_kernel, POOL_STRIDE, POOL_PADDING, 1, 1)
    }
}

impl Discriminator for MultiScaleDiscriminator {
    fn forward(&self, audio: &Array) -> Result<Vec<DiscriminatorOutput>> {
        let mut outputs = Vec::with_capacity(self.discriminators.len());
        let mut x = audio.clone();
        for (i, disc) in self.discriminators.iter().enumerate() {
            if i > 0 {
                x = self.pool(&x)?;
            }
            outputs.push(disc.forward(&x)?);
        }
        Ok(outputs)
    }
}

/// Single scale discriminator: seven grouped strided convolutions and a
/// one-channel output convolution.
#[derive(Debug, ModuleParameters)]
pub struct ScaleDiscriminator {
    #[param]
    pub convs: Vec<WeightNormConv1d>,
    #[param]
    pub conv_post: WeightNormConv1d,
}

impl ScaleDiscriminator {
    pub fn new(channels: &[i32]) -> Result<Self> {
        let mut convs = Vec::with_capacity(channels.len());
        let mut in_ch = 1;
        for (i, &out_ch) in channels.iter().enumerate() {
            convs.push(WeightNormConv1d::new(
                in_ch,
                out_ch,
                SCALE_KERNELS[i],
                Some(SCALE_STRIDES[i]),
                Some(SCALE_PADDINGS[i]),
                None,
                Some(SCALE_GROUPS[i]),
            )?);
            in_ch = out_ch;
        }
        let conv_post = WeightNormConv1d::new(in_ch, 1, 3, Some(1), Some(1), None, None)?;

        Ok(Self { convs, conv_post })
    }

    pub fn forward(&self, audio: &Array) -> Result<DiscriminatorOutput> {
        let mut x = audio.clone();
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_discriminator_features() {
        let disc = ScaleDiscriminator::new(&[16, 16, 32, 32, 64, 64, 64]).unwrap();
        let audio = mlx_rs::random::normal::<f32>(&[1, 1, 256], None, None, None).unwrap();
        let output = disc.forward(&audio).unwrap();

        assert_eq!(output.features.len(), 8);
        // 256 -> 256 -> 128 -> 64 -> 16 -> 4 -> 4 -> 4
        assert_eq!(output.logits.shape(), &[1, 4]);
    }

    #[test]
    fn test_pool_halves_length() {
        let msd = MultiScaleDiscriminator::new(&DiscriminatorConfig::tiny()).unwrap();
        let audio = mlx_rs::ops::ones::<f32>(&[2, 1, 256]).unwrap();
        let pooled = msd.pool(&audio).unwrap();
        assert_eq!(pooled.shape(), &[2, 1, 129]);

        // interior windows average four ones
        use mlx_rs::ops::indexing::IndexOp;
        let mid = pooled.index((0, 0, 64));
        mid.eval().unwrap();
        assert!((mid.item::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_msd_scales() {
        let msd = MultiScaleDiscriminator::new(&DiscriminatorConfig::tiny()).unwrap();
        let audio = mlx_rs::random::normal::<f32>(&[2, 1, 1024], None, None, None).unwrap();
        let outputs = msd.forward(&audio).unwrap();

        assert_eq!(outputs.len(), 3);
        for out in &outputs {
            assert_eq!(out.logits.dim(0), 2);
        }
        // pooled inputs give shorter logits
        assert!(outputs[2].logits.dim(1) < outputs[0].logits.dim(1));
    }

    #[test]
    fn test_pool_kernel_is_not_a_parameter() {
        use mlx_rs::module::ModuleParameters;
        let msd = MultiScaleDiscriminator::new(&DiscriminatorConfig::tiny()).unwrap();
        let params = msd.parameters().flatten();
        assert!(params.keys().all(|k| k.starts_with("discriminators.")));
    }
}
