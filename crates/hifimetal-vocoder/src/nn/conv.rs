//! Weight-normalized convolution layers.
//!
//! Every learned convolution in the generator and the discriminators is
//! weight-normalized: `W = g * v / ||v||`, with the norm taken per output
//! channel (per input channel for transposed convolutions, matching the
//! `[in, out, k]` weight layout).

use crate::error::Result;
use mlx_rs::{macros::ModuleParameters, module::Param, Array};

/// Weight-normalized 1D convolution on `[batch, channels, length]` tensors.
#[derive(Debug, ModuleParameters)]
pub struct WeightNormConv1d {
    /// Direction parameter `[out, in/groups, k]`.
    #[param]
    pub weight_v: Param<Array>,
    /// Magnitude parameter `[out, 1, 1]`.
    #[param]
    pub weight_g: Param<Array>,
    #[param]
    pub bias: Param<Option<Array>>,
    pub in_channels: i32,
    pub out_channels: i32,
    pub kernel_size: i32,
    pub stride: i32,
    pub padding: i32,
    pub dilation: i32,
    pub groups: i32,
}

impl WeightNormConv1d {
    /// Create a new weight-normalized Conv1d.
    ///
    /// # Arguments
    /// * `in_channels` - Number of input channels
    /// * `out_channels` - Number of output channels
    /// * `kernel_size` - Kernel size
    /// * `stride` - Stride (default 1)
    /// * `padding` - Padding (default 0)
    /// * `dilation` - Dilation (default 1)
    /// * `groups` - Groups (default 1)
    pub fn new(
        in_channels: i32,
        out_channels: i32,
        kernel_size: i32,
        stride: Option<i32>,
        padding: Option<i32>,
        dilation: Option<i32>,
        groups: Option<i32>,
    ) -> Result<Self> {
        let stride = stride.unwrap_or(1);
        let padding = padding.unwrap_or(0);
        let dilation = dilation.unwrap_or(1);
        let groups = groups.unwrap_or(1);

        let fan_in = (in_channels / groups) * kernel_size;
        let bound = (1.0 / fan_in as f32).sqrt();

        let weight_v = mlx_rs::random::uniform::<_, f32>(
            -bound,
            bound,
            &[out_channels, in_channels / groups, kernel_size],
            None,
        )?;
        let weight_g = weight_norm(&weight_v)?;
        let bias = mlx_rs::random::uniform::<_, f32>(-bound, bound, &[out_channels], None)?;

        Ok(Self {
            weight_v: Param::new(weight_v),
            weight_g: Param::new(weight_g),
            bias: Param::new(Some(bias)),
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            dilation,
            groups,
        })
    }

    /// Padding that keeps the length unchanged for stride 1.
    pub fn same_padding(kernel_size: i32, dilation: i32) -> i32 {
        (kernel_size * dilation - dilation) / 2
    }

    /// Compute normalized weight: W = g * (v / ||v||)
    fn compute_weight(&self) -> Result<Array> {
        let v = self.weight_v.as_ref();
        let norm = weight_norm(v)?;
        Ok(v.divide(&norm)?.multiply(self.weight_g.as_ref())?)
    }

    /// Forward pass: `[batch, in, length] -> [batch, out, new_length]`.
    pub fn forward(&self, x: &Array) -> Result<Array> {
        let weight = self.compute_weight()?;
        let output = conv1d_ncl(
            x,
            &weight,
            self.stride,
            self.padding,
            self.dilation,
            self.groups,
        )?;
        add_bias(output, self.bias.value.as_ref(), self.out_channels)
    }
}

/// Weight-normalized transposed 1D convolution, used for upsampling.
#[derive(Debug, ModuleParameters)]
pub struct WeightNormConvTranspose1d {
    /// Direction parameter `[in, out, k]`.
    #[param]
    pub weight_v: Param<Array>,
    /// Magnitude parameter `[in, 1, 1]`.
    #[param]
    pub weight_g: Param<Array>,
    #[param]
    pub bias: Param<Option<Array>>,
    pub in_channels: i32,
    pub out_channels: i32,
    pub kernel_size: i32,
    pub stride: i32,
    pub padding: i32,
}

impl WeightNormConvTranspose1d {
    /// Create a new weight-normalized ConvTranspose1d.
    pub fn new(
        in_channels: i32,
        out_channels: i32,
        kernel_size: i32,
        stride: i32,
        padding: i32,
    ) -> Result<Self> {
        let fan_in = out_channels * kernel_size;
        let bound = (1.0 / fan_in as f32).sqrt();

        let weight_v = mlx_rs::random::uniform::<_, f32>(
            -bound,
            bound,
            &[in_channels, out_channels, kernel_size],
            None,
        )?;
        let weight_g = weight_norm(&weight_v)?;
        let bias = mlx_rs::random::uniform::<_, f32>(-bound, bound, &[out_channels], None)?;

        Ok(Self {
            weight_v: Param::new(weight_v),
            weight_g: Param::new(weight_g),
            bias: Param::new(Some(bias)),
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
        })
    }

    fn compute_weight(&self) -> Result<Array> {
        let v = self.weight_v.as_ref();
        let norm = weight_norm(v)?;
        Ok(v.divide(&norm)?.multiply(self.weight_g.as_ref())?)
    }

    /// Output length for a given input length.
    pub fn output_length(&self, input_length: i32) -> i32 {
        (input_length - 1) * self.stride - 2 * self.padding + self.kernel_size
    }

    /// Forward pass: `[batch, in, L] -> [batch, out, (L-1)*s - 2p + k]`.
    pub fn forward(&self, x: &Array) -> Result<Array> {
        // [in, out, k] -> [out, in, k]
        let weight = self.compute_weight()?.transpose_axes(&[1, 0, 2])?;
        let output = conv_transpose1d_ncl(x, &weight, self.stride, self.padding)?;
        add_bias(output, self.bias.value.as_ref(), self.out_channels)
    }
}

/// Norm over all axes but the first, shaped `[n, 1, 1]` for broadcasting.
fn weight_norm(weight: &Array) -> Result<Array> {
    let sum_sq = weight.multiply(weight)?.sum_axes(&[1, 2], Some(true))?;
    Ok(sum_sq.sqrt()?.add(&Array::from_f32(1e-12))?)
}

fn add_bias(output: Array, bias: Option<&Array>, channels: i32) -> Result<Array> {
    match bias {
        Some(bias) => Ok(output.add(&bias.reshape(&[1, channels, 1])?)?),
        None => Ok(output),
    }
}

/// `conv1d` on NCL tensors with an OIK weight.
///
/// MLX convolutions take NLC input and OKI weights, so both are transposed
/// on the way in and the output on the way out.
pub(crate) fn conv1d_ncl(
    x: &Array,
    weight: &Array,
    stride: i32,
    padding: i32,
    dilation: i32,
    groups: i32,
) -> Result<Array> {
    let x_nlc = x.transpose_axes(&[0, 2, 1])?;
    let weight_oki = weight.transpose_axes(&[0, 2, 1])?;
    let output = mlx_rs::ops::conv1d(&x_nlc, &weight_oki, stride, padding, dilation, groups)?;
    Ok(output.transpose_axes(&[0, 2, 1])?)
}

/// Reverse an array along one axis.
fn flip_axis(arr: &Array, axis: i32) -> Result<Array> {
    let axis_len = arr.dim(axis);
    let indices: Vec<i32> = (0..axis_len).rev().collect();
    let indices = Array::from_slice(&indices, &[axis_len]);
    Ok(arr.take_axis(&indices, axis)?)
}

/// Transposed convolution as zero-insertion followed by a flipped-kernel conv.
///
/// `weight` is OIK (`[out, in, k]`).
fn conv_transpose1d_ncl(x: &Array, weight: &Array, stride: i32, padding: i32) -> Result<Array> {
    let batch = x.dim(0);
    let in_channels = x.dim(1);
    let in_length = x.dim(2);
    let kernel_size = weight.dim(2);

    let upsampled = if stride > 1 {
        use mlx_rs::ops::indexing::IndexOp;
        let zeros = mlx_rs::ops::zeros::<f32>(&[batch, in_channels, in_length, stride - 1])?;
        let expanded = x.reshape(&[batch, in_channels, in_length, 1])?;
        let interleaved = mlx_rs::ops::concatenate_axis(&[&expanded, &zeros], -1)?
            .reshape(&[batch, in_channels, in_length * stride])?;
        // drop the trailing zeros after the last sample
        interleaved.index((.., .., ..(in_length - 1) * stride + 1))
    } else {
        x.clone()
    };

    let flipped = flip_axis(weight, 2)?;
    let conv_padding = (kernel_size - 1 - padding).max(0);
    conv1d_ncl(&upsampled, &flipped, 1, conv_padding, 1, 1)
}
