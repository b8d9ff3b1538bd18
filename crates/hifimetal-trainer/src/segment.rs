//! Random segment selection and aligned slicing.
//!
//! Training runs on fixed-length windows: a window of `segment_frames` mel
//! frames is drawn per example, and the target waveform is cut at the same
//! place, `offset * hop` samples in, for `segment_frames * hop` samples.
//!
//! Examples shorter than a segment start at offset 0. The physical tensor is
//! padded past their end, so the caller masks the frames beyond
//! [`SegmentSample::valid_frames`].

use mlx_rs::{ops::indexing::IndexOp, Array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{Result, TrainerError};

/// A batch of aligned mel segments.
#[derive(Debug, Clone)]
pub struct SegmentSample {
    /// Sliced features `[batch, channels, segment_frames]`.
    pub mel: Array,
    /// Start frame per example.
    pub offsets: Vec<i32>,
    /// Frames inside each segment that hold real (unpadded) content.
    pub valid_frames: Vec<i32>,
}

impl SegmentSample {
    /// Sample offsets of every example, `offset * hop`.
    pub fn sample_offsets(&self, hop_length: i32) -> Vec<i32> {
        self.offsets.iter().map(|&o| o * hop_length).collect()
    }
}

/// Seeded sampler of per-example segment offsets.
#[derive(Debug)]
pub struct SegmentSampler {
    rng: StdRng,
}

impl SegmentSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw one offset per example, uniform in `[0, max(len - segment, 0)]`.
    ///
    /// Lengths past the physical frame count are clipped to it.
    pub fn draw_offsets(
        &mut self,
        lengths: &[i32],
        available: i32,
        segment_frames: i32,
    ) -> (Vec<i32>, Vec<i32>) {
        lengths
            .iter()
            .map(|&len| {
                let valid = len.clamp(0, available);
                let max_offset = (valid - segment_frames).max(0);
                let offset = self.rng.gen_range(0..=max_offset);
                (offset, valid.min(segment_frames))
            })
            .unzip()
    }

    /// Choose a segment per example and slice `mel` accordingly.
    ///
    /// # Arguments
    /// * `mel` - Features `[batch, channels, frames]`
    /// * `mel_lengths` - Valid frames per example
    /// * `segment_frames` - Segment length in frames
    ///
    /// # Errors
    /// [`TrainerError::SegmentBounds`] when the tensor holds fewer than
    /// `segment_frames` frames.
    pub fn sample(
        &mut self,
        mel: &Array,
        mel_lengths: &[i32],
        segment_frames: i32,
    ) -> Result<SegmentSample> {
        let available = mel.dim(2);
        if available < segment_frames {
            return Err(TrainerError::SegmentBounds {
                offset: 0,
                segment: segment_frames,
                available,
            });
        }
        if mel_lengths.len() != mel.dim(0) as usize {
            return Err(TrainerError::Config(format!(
                "{} lengths for a batch of {}",
                mel_lengths.len(),
                mel.dim(0)
            )));
        }

        let (offsets, valid_frames) = self.draw_offsets(mel_lengths, available, segment_frames);
        let mel = slice_segments(mel, &offsets, segment_frames)?;

        Ok(SegmentSample {
            mel,
            offsets,
            valid_frames,
        })
    }
}

/// Slice `[batch, channels, time]` at a per-example start for `size` steps.
pub fn slice_segments(x: &Array, offsets: &[i32], size: i32) -> Result<Array> {
    let available = x.dim(2);
    let mut rows = Vec::with_capacity(offsets.len());
    for (i, &offset) in offsets.iter().enumerate() {
        if offset < 0 || offset + size > available {
            return Err(TrainerError::SegmentBounds {
                offset,
                segment: size,
                available,
            });
        }
        let i = i as i32;
        rows.push(x.index((i..i + 1, .., offset..offset + size)));
    }
    let refs: Vec<&Array> = rows.iter().collect();
    Ok(mlx_rs::ops::concatenate_axis(&refs, 0)?)
}

/// Float mask `[batch, max_len]`: 1 where `t < lengths[b]`.
pub fn sequence_mask(lengths: &[i32], max_len: i32) -> Array {
    let mask: Vec<f32> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| if t < len { 1.0 } else { 0.0 }))
        .collect();
    Array::from_slice(&mask, &[lengths.len() as i32, max_len])
}
