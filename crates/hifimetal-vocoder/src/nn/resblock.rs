//! Dilated residual block of the generator.

use super::WeightNormConv1d;
use crate::error::Result;
use mlx_rs::{macros::ModuleParameters, Array};

/// Negative slope used between generator and discriminator convolutions.
pub const LRELU_SLOPE: f32 = 0.1;

/// Residual stack of dilated convolutions (the "type 1" block).
///
/// Each branch is `x + conv2(lrelu(conv1_d(lrelu(x))))`, where `conv1_d` is
/// dilated and `conv2` is not; length is preserved throughout.
#[derive(Debug, ModuleParameters)]
pub struct ResBlock {
    #[param]
    pub convs1: Vec<WeightNormConv1d>,
    #[param]
    pub convs2: Vec<WeightNormConv1d>,
}

impl ResBlock {
    pub fn new(channels: i32, kernel_size: i32, dilations: &[i32]) -> Result<Self> {
        let mut convs1 = Vec::with_capacity(dilations.len());
        let mut convs2 = Vec::with_capacity(dilations.len());
        for &dilation in dilations {
            convs1.push(WeightNormConv1d::new(
                channels,
                channels,
                kernel_size,
                Some(1),
                Some(WeightNormConv1d::same_padding(kernel_size, dilation)),
                Some(dilation),
                None,
            )?);
            convs2.push(WeightNormConv1d::new(
                channels,
                channels,
                kernel_size,
                Some(1),
                Some(WeightNormConv1d::same_padding(kernel_size, 1)),
                None,
                None,
            )?);
        }
        Ok(Self { convs1, convs2 })
    }

    pub fn forward(&self, x: &Array) -> Result<Array> {
        let mut x = x.clone();
        for (c1, c2) in self.convs1.iter().zip(&self.convs2) {
            let xt = mlx_rs::nn::leaky_relu(&x, LRELU_SLOPE)?;
            let xt = c1.forward(&xt)?;
            let xt = mlx_rs::nn::leaky_relu(&xt, LRELU_SLOPE)?;
            let xt = c2.forward(&xt)?;
            x = xt.add(&x)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::module::ModuleParameters;

    #[test]
    fn test_resblock_preserves_shape() {
        let block = ResBlock::new(8, 5, &[1, 3, 5]).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[2, 8, 40], None, None, None).unwrap();
        let y = block.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 8, 40]);
    }

    #[test]
    fn test_resblock_parameter_layout() {
        let block = ResBlock::new(4, 3, &[1, 3]).unwrap();
        let params = block.parameters().flatten();
        // two branches, two convs each, three tensors per conv
        assert_eq!(params.len(), 12);
        assert!(params.contains_key("convs1.1.weight_v"));
        assert!(params.contains_key("convs2.0.bias"));
    }
}
