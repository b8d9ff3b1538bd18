//! Padded audio batches handed to the trainer.

use mlx_rs::Array;

use crate::{Result, TrainerError};

/// A padded batch of conditioning and target waveforms.
///
/// Both waveforms are `[batch, 1, samples]`; lengths give the valid prefix of
/// each row. Conditioning and target usually come from the same recording;
/// they differ when the conditioning side is degraded on purpose.
#[derive(Debug, Clone)]
pub struct AudioBatch {
    pub conditioning_waveform: Array,
    pub conditioning_lengths: Vec<i32>,
    pub target_waveform: Array,
    pub target_lengths: Vec<i32>,
}

impl AudioBatch {
    /// Build a batch, checking shapes and lengths.
    pub fn new(
        conditioning_waveform: Array,
        conditioning_lengths: Vec<i32>,
        target_waveform: Array,
        target_lengths: Vec<i32>,
    ) -> Result<Self> {
        check_waveform("conditioning", &conditioning_waveform, &conditioning_lengths)?;
        check_waveform("target", &target_waveform, &target_lengths)?;
        if conditioning_waveform.dim(0) != target_waveform.dim(0) {
            return Err(TrainerError::Config(format!(
                "conditioning batch {} differs from target batch {}",
                conditioning_waveform.dim(0),
                target_waveform.dim(0)
            )));
        }

        Ok(Self {
            conditioning_waveform,
            conditioning_lengths,
            target_waveform,
            target_lengths,
        })
    }

    /// Batch where conditioning and target are the same recordings.
    pub fn paired(waveform: Array, lengths: Vec<i32>) -> Result<Self> {
        Self::new(waveform.clone(), lengths.clone(), waveform, lengths)
    }

    pub fn batch_size(&self) -> i32 {
        self.target_waveform.dim(0)
    }

    /// Conditioning lengths converted to mel frames.
    pub fn mel_lengths(&self, hop_length: i32) -> Vec<i32> {
        self.conditioning_lengths
            .iter()
            .map(|&len| len / hop_length)
            .collect()
    }
}

fn check_waveform(name: &str, waveform: &Array, lengths: &[i32]) -> Result<()> {
    if waveform.ndim() != 3 || waveform.dim(1) != 1 {
        return Err(hifimetal_vocoder::VocoderError::ShapeMismatch {
            expected: vec![-1, 1, -1],
            actual: waveform.shape().to_vec(),
        }
        .into());
    }
    if lengths.len() != waveform.dim(0) as usize {
        return Err(TrainerError::Config(format!(
            "{} batch has {} rows but {} lengths",
            name,
            waveform.dim(0),
            lengths.len()
        )));
    }
    let samples = waveform.dim(2);
    if let Some(&len) = lengths.iter().find(|&&l| l < 0 || l > samples) {
        return Err(TrainerError::Config(format!(
            "{} length {} outside [0, {}]",
            name, len, samples
        )));
    }
    Ok(())
}
