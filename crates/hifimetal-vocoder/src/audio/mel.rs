//! Mel filterbank and log-mel compression.

use crate::error::Result;
use hifimetal_core::DataConfig;
use mlx_rs::Array;

/// Floor applied before the logarithm.
pub const LOG_CLIP: f32 = 1e-5;

/// Mel filterbank configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MelConfig {
    /// Sampling rate in Hz.
    pub sr: i32,
    /// Number of FFT bins.
    pub n_fft: i32,
    /// Number of mel frequency bins.
    pub n_mels: i32,
    /// Minimum frequency in Hz.
    pub fmin: f32,
    /// Maximum frequency in Hz (defaults to sr/2).
    pub fmax: Option<f32>,
    /// Whether to use HTK formula (vs Slaney).
    pub htk: bool,
    /// Normalization type for filterbank.
    pub norm: MelNorm,
}

/// Mel filterbank normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MelNorm {
    /// No normalization.
    None,
    /// Slaney-style normalization (constant energy per band).
    #[default]
    Slaney,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self::from(&DataConfig::default())
    }
}

impl From<&DataConfig> for MelConfig {
    fn from(data: &DataConfig) -> Self {
        Self {
            sr: data.sampling_rate,
            n_fft: data.filter_length,
            n_mels: data.n_mel_channels,
            fmin: data.mel_fmin,
            fmax: data.mel_fmax,
            htk: false,
            norm: MelNorm::Slaney,
        }
    }
}

/// Convert frequency in Hz to mel scale.
///
/// # Arguments
/// * `freq` - Frequency in Hz
/// * `htk` - Use HTK formula if true, Slaney otherwise
pub fn hz_to_mel(freq: f32, htk: bool) -> f32 {
    if htk {
        2595.0 * (1.0 + freq / 700.0).log10()
    } else {
        // linear below 1 kHz, logarithmic above
        let f_sp = 200.0 / 3.0;
        let min_log_hz = 1000.0;
        let min_log_mel = min_log_hz / f_sp;
        let logstep = (6.4f32).ln() / 27.0;

        if freq >= min_log_hz {
            min_log_mel + (freq / min_log_hz).ln() / logstep
        } else {
            freq / f_sp
        }
    }
}

/// Convert mel scale to frequency in Hz.
pub fn mel_to_hz(mel: f32, htk: bool) -> f32 {
    if htk {
        700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
    } else {
        let f_sp = 200.0 / 3.0;
        let min_log_hz = 1000.0;
        let min_log_mel = min_log_hz / f_sp;
        let logstep = (6.4f32).ln() / 27.0;

        if mel >= min_log_mel {
            min_log_hz * ((mel - min_log_mel) * logstep).exp()
        } else {
            f_sp * mel
        }
    }
}

/// Triangular mel filterbank weights as a host buffer.
///
/// Triangles are evaluated on the linear FFT frequency grid (the librosa
/// construction), so neighbouring filters overlap at their half-height.
pub fn mel_filterbank_weights(config: &MelConfig) -> Vec<f32> {
    let fmax = config.fmax.unwrap_or(config.sr as f32 / 2.0);
    let n_freqs = (config.n_fft / 2 + 1) as usize;
    let n_mels = config.n_mels as usize;

    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|k| k as f32 * config.sr as f32 / config.n_fft as f32)
        .collect();

    let mel_min = hz_to_mel(config.fmin, config.htk);
    let mel_max = hz_to_mel(fmax, config.htk);
    let hz_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| {
            let m = mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32;
            mel_to_hz(m, config.htk)
        })
        .collect();

    let mut weights = vec![0.0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (left, center, right) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        let enorm = match config.norm {
            MelNorm::Slaney => 2.0 / (right - left),
            MelNorm::None => 1.0,
        };
        for (k, &f) in fft_freqs.iter().enumerate() {
            let lower = (f - left) / (center - left);
            let upper = (right - f) / (right - center);
            weights[m * n_freqs + k] = lower.min(upper).max(0.0) * enorm;
        }
    }
    weights
}

/// Create mel filterbank matrix.
///
/// # Returns
/// Mel filterbank matrix [n_mels, n_fft/2+1]
pub fn mel_filterbank(config: &MelConfig) -> Result<Array> {
    let weights = mel_filterbank_weights(config);
    Ok(Array::from_slice(
        &weights,
        &[config.n_mels, config.n_fft / 2 + 1],
    ))
}

/// Project a linear magnitude spectrogram onto the mel filterbank.
///
/// `[n_mels, freq] @ [batch, freq, frames] -> [batch, n_mels, frames]`
pub fn spec_to_mel(spec: &Array, filterbank: &Array) -> Result<Array> {
    Ok(filterbank.matmul(spec)?)
}

/// Apply log compression: `ln(max(x, clip))`.
pub fn log_compress(mel_spec: &Array, clip_val: Option<f32>) -> Result<Array> {
    let clip = Array::from_f32(clip_val.unwrap_or(LOG_CLIP));
    let clipped = mlx_rs::ops::maximum(mel_spec, &clip)?;
    Ok(clipped.log()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hz_to_mel_htk() {
        let mel = hz_to_mel(1000.0, true);
        assert!((mel - 1000.0).abs() < 1.0);
    }

    #[test]
    fn test_hz_to_mel_slaney_linear_region() {
        assert!((hz_to_mel(1000.0, false) - 15.0).abs() < 1e-4);
        assert!((hz_to_mel(500.0, false) - 7.5).abs() < 1e-4);
    }

    #[test]
    fn test_mel_to_hz_roundtrip() {
        for freq in [100.0, 999.0, 2000.0, 16000.0] {
            let back = mel_to_hz(hz_to_mel(freq, false), false);
            assert!((freq - back).abs() / freq < 1e-4);
        }
    }

    #[test]
    fn test_mel_filterbank_shape() {
        let config = MelConfig {
            sr: 24000,
            n_fft: 1024,
            n_mels: 80,
            fmin: 0.0,
            fmax: Some(12000.0),
            htk: false,
            norm: MelNorm::Slaney,
        };

        let fb = mel_filterbank(&config).unwrap();
        assert_eq!(fb.shape(), &[80, 513]);
    }

    #[test]
    fn test_filters_are_nonnegative_and_nonempty() {
        let config = MelConfig::default();
        let weights = mel_filterbank_weights(&config);
        let n_freqs = (config.n_fft / 2 + 1) as usize;

        assert!(weights.iter().all(|w| *w >= 0.0));
        for row in weights.chunks(n_freqs) {
            assert!(row.iter().any(|w| *w > 0.0));
        }
    }

    #[test]
    fn test_log_compress_clips() {
        let x = Array::from_slice(&[0.0f32, 1.0], &[2]);
        let y = log_compress(&x, None).unwrap();
        y.eval().unwrap();
        let values = y.as_slice::<f32>();
        assert!((values[0] - LOG_CLIP.ln()).abs() < 1e-4);
        assert!(values[1].abs() < 1e-6);
    }
}
