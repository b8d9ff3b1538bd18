//! Short-time magnitude spectrum on MLX.
//!
//! Framing follows the vocoder convention: the signal is reflect-padded by
//! `(n_fft - hop) / 2` on both sides and framed without centering, so a signal
//! of `n * hop` samples yields exactly `n` frames. Each frame is windowed and
//! transformed with `mlx_rs::fft::rfft`.

use crate::error::{Result, VocoderError};
use hifimetal_core::DataConfig;
use mlx_rs::Array;

/// Magnitude floor added to the power spectrum before the square root.
pub const MAGNITUDE_EPS: f32 = 1e-6;

/// STFT configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StftConfig {
    /// FFT size.
    pub n_fft: i32,
    /// Hop size in samples.
    pub hop_length: i32,
    /// Window size (centered inside `n_fft` when shorter).
    pub win_length: i32,
    /// Padding mode for the framing pad.
    pub pad_mode: PadMode,
}

/// Padding modes for framing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PadMode {
    /// Reflect padding (mirror, edge sample excluded).
    #[default]
    Reflect,
    /// Zero padding.
    Zeros,
}

impl Default for StftConfig {
    fn default() -> Self {
        Self::from(&DataConfig::default())
    }
}

impl From<&DataConfig> for StftConfig {
    fn from(data: &DataConfig) -> Self {
        Self {
            n_fft: data.filter_length,
            hop_length: data.hop_length,
            win_length: data.win_length,
            pad_mode: PadMode::Reflect,
        }
    }
}

impl StftConfig {
    /// Samples padded on each side before framing.
    pub fn frame_pad(&self) -> i32 {
        (self.n_fft - self.hop_length) / 2
    }

    /// Number of linear frequency bins.
    pub fn n_freqs(&self) -> i32 {
        self.n_fft / 2 + 1
    }

    /// Number of frames produced for `samples` input samples.
    pub fn num_frames(&self, samples: i32) -> i32 {
        let padded = samples + 2 * self.frame_pad();
        (padded - self.n_fft) / self.hop_length + 1
    }
}

/// Periodic Hann window, as used for spectral analysis.
///
/// `w[n] = 0.5 - 0.5 * cos(2*pi*n / N)`
pub fn hann_window(size: i32) -> Vec<f32> {
    let n = size as f64;
    (0..size)
        .map(|i| (0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / n).cos()) as f32)
        .collect()
}

/// Pad a `[batch, samples]` signal on both sides.
pub fn pad_signal(signal: &Array, left: i32, right: i32, mode: PadMode) -> Result<Array> {
    let batch_size = signal.dim(0);
    let length = signal.dim(1);

    if left == 0 && right == 0 {
        return Ok(signal.clone());
    }

    match mode {
        PadMode::Zeros => {
            let left_pad = mlx_rs::ops::zeros::<f32>(&[batch_size, left])?;
            let right_pad = mlx_rs::ops::zeros::<f32>(&[batch_size, right])?;
            Ok(mlx_rs::ops::concatenate_axis(&[&left_pad, signal, &right_pad], 1)?)
        }
        PadMode::Reflect => {
            if left >= length || right >= length {
                return Err(VocoderError::ShapeMismatch {
                    expected: vec![batch_size, left.max(right) + 1],
                    actual: vec![batch_size, length],
                });
            }
            // left: x[left], x[left-1], ..., x[1]
            let left_indices: Vec<i32> = (1..=left).rev().collect();
            // right: x[L-2], x[L-3], ..., x[L-1-right]
            let right_indices: Vec<i32> = ((length - right - 1)..(length - 1)).rev().collect();

            let mut parts = Vec::with_capacity(3);
            if left > 0 {
                let indices = Array::from_slice(&left_indices, &[left]);
                parts.push(signal.take_axis(&indices, 1)?);
            }
            parts.push(signal.clone());
            if right > 0 {
                let indices = Array::from_slice(&right_indices, &[right]);
                parts.push(signal.take_axis(&indices, 1)?);
            }
            let refs: Vec<&Array> = parts.iter().collect();
            Ok(mlx_rs::ops::concatenate_axis(&refs, 1)?)
        }
    }
}

/// Gather overlapping frames: `[batch, samples]` -> `[batch, frames, frame_length]`.
pub fn frame_signal(signal: &Array, frame_length: i32, hop_length: i32) -> Result<Array> {
    let length = signal.dim(1);
    if length < frame_length {
        return Err(VocoderError::ShapeMismatch {
            expected: vec![signal.dim(0), frame_length],
            actual: vec![signal.dim(0), length],
        });
    }
    let num_frames = (length - frame_length) / hop_length + 1;
    let indices: Vec<i32> = (0..num_frames)
        .flat_map(|f| (0..frame_length).map(move |k| f * hop_length + k))
        .collect();
    let indices = Array::from_slice(&indices, &[num_frames, frame_length]);
    Ok(signal.take_axis(&indices, 1)?)
}

/// Windowed real FFT over reflect-padded frames.
#[derive(Debug)]
pub struct Stft {
    config: StftConfig,
    /// Hann window zero-padded to `n_fft`, shape `[n_fft]`.
    window: Array,
}

impl Stft {
    /// Build the analysis window for a configuration.
    pub fn new(config: StftConfig) -> Result<Self> {
        if config.win_length > config.n_fft || config.hop_length <= 0 {
            return Err(VocoderError::Config(format!(
                "invalid STFT framing: n_fft {}, hop {}, win {}",
                config.n_fft, config.hop_length, config.win_length
            )));
        }

        let mut window = vec![0.0f32; config.n_fft as usize];
        let offset = ((config.n_fft - config.win_length) / 2) as usize;
        for (i, w) in hann_window(config.win_length).into_iter().enumerate() {
            window[offset + i] = w;
        }

        Ok(Self {
            window: Array::from_slice(&window, &[config.n_fft]),
            config,
        })
    }

    pub fn config(&self) -> &StftConfig {
        &self.config
    }

    /// Analysis window, shape `[n_fft]`.
    pub fn window(&self) -> &Array {
        &self.window
    }

    /// Magnitude spectrogram.
    ///
    /// # Arguments
    /// * `signal` - Audio `[batch, samples]`
    ///
    /// # Returns
    /// `sqrt(re^2 + im^2 + 1e-6)` with shape `[batch, n_freqs, frames]`
    pub fn magnitude(&self, signal: &Array) -> Result<Array> {
        let pad = self.config.frame_pad();
        let padded = pad_signal(signal, pad, pad, self.config.pad_mode)?;
        let frames = frame_signal(&padded, self.config.n_fft, self.config.hop_length)?;

        // [batch, frames, n_fft] * [n_fft]
        let windowed = frames.multiply(&self.window)?;
        let spectrum = mlx_rs::fft::rfft(&windowed, Some(self.config.n_fft), -1)?;

        let abs = spectrum.abs()?;
        let power = abs.multiply(&abs)?;
        let magnitude = power.add(&Array::from_f32(MAGNITUDE_EPS))?.sqrt()?;

        // [batch, frames, freq] -> [batch, freq, frames]
        Ok(magnitude.transpose_axes(&[0, 2, 1])?)
    }
}
