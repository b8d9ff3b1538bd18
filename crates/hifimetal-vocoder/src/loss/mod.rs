//! Loss functions for adversarial vocoder training.
//!
//! Least-squares adversarial losses for both players, feature matching,
//! and (masked) mel reconstruction. Every function is pure: scores and
//! spectrograms in, scalar arrays out.

use crate::error::{Result, VocoderError};
use mlx_rs::Array;

/// Discriminator loss with per-sub-discriminator terms.
#[derive(Debug, Clone)]
pub struct DiscriminatorLossOutput {
    /// Sum of all real and generated terms.
    pub total: Array,
    /// `mean((1 - D(x))^2)` per sub-discriminator.
    pub real_terms: Vec<Array>,
    /// `mean(D(G(z))^2)` per sub-discriminator.
    pub generated_terms: Vec<Array>,
}

/// Generator adversarial loss with per-sub-discriminator terms.
#[derive(Debug, Clone)]
pub struct AdversarialLossOutput {
    pub total: Array,
    pub terms: Vec<Array>,
}

/// Masked reconstruction loss.
#[derive(Debug, Clone)]
pub struct MaskedLoss {
    /// Mean over examples whose mask is not empty; 0 if none is.
    pub loss: Array,
    /// Number of examples that contributed.
    pub valid_examples: Array,
}

/// Discriminator adversarial loss.
///
/// L(D) = sum_k E[(1 - D_k(x))^2] + E[D_k(G(z))^2]
pub fn discriminator_loss(
    real_scores: &[Array],
    generated_scores: &[Array],
) -> Result<DiscriminatorLossOutput> {
    check_pairing(real_scores.len(), generated_scores.len())?;

    let one = Array::from_f32(1.0);
    let mut total = Array::from_f32(0.0);
    let mut real_terms = Vec::with_capacity(real_scores.len());
    let mut generated_terms = Vec::with_capacity(generated_scores.len());

    for (real, generated) in real_scores.iter().zip(generated_scores) {
        let real_diff = one.subtract(real)?;
        let real_loss = real_diff.multiply(&real_diff)?.mean(None)?;
        let generated_loss = generated.multiply(generated)?.mean(None)?;

        total = total.add(&real_loss)?.add(&generated_loss)?;
        real_terms.push(real_loss);
        generated_terms.push(generated_loss);
    }

    Ok(DiscriminatorLossOutput {
        total,
        real_terms,
        generated_terms,
    })
}

/// Generator adversarial loss.
///
/// L_adv(G) = sum_k E[(1 - D_k(G(z)))^2]
pub fn generator_adversarial_loss(generated_scores: &[Array]) -> Result<AdversarialLossOutput> {
    let one = Array::from_f32(1.0);
    let mut total = Array::from_f32(0.0);
    let mut terms = Vec::with_capacity(generated_scores.len());

    for generated in generated_scores {
        let diff = one.subtract(generated)?;
        let loss = diff.multiply(&diff)?.mean(None)?;
        total = total.add(&loss)?;
        terms.push(loss);
    }

    Ok(AdversarialLossOutput { total, terms })
}

/// Feature matching loss.
///
/// Mean absolute difference per layer, averaged over every layer of every
/// sub-discriminator.
pub fn feature_matching_loss(
    real_feature_maps: &[Vec<Array>],
    generated_feature_maps: &[Vec<Array>],
) -> Result<Array> {
    check_pairing(real_feature_maps.len(), generated_feature_maps.len())?;

    let mut total = Array::from_f32(0.0);
    let mut num_layers = 0;

    for (real, generated) in real_feature_maps.iter().zip(generated_feature_maps) {
        check_pairing(real.len(), generated.len())?;
        for (r, g) in real.iter().zip(generated) {
            total = total.add(&r.subtract(g)?.abs()?.mean(None)?)?;
            num_layers += 1;
        }
    }

    if num_layers > 0 {
        total = total.divide(&Array::from_int(num_layers))?;
    }
    Ok(total)
}

/// Unmasked mel L1 loss.
pub fn mel_l1_loss(target: &Array, generated: &Array) -> Result<Array> {
    check_shapes(target, generated)?;
    Ok(target.subtract(generated)?.abs()?.mean(None)?)
}

/// Mel L1 loss restricted to valid frames.
///
/// # Arguments
/// * `target` - Target mel `[batch, n_mels, frames]`
/// * `generated` - Generated mel, same shape
/// * `mask` - Float frame mask `[batch, frames]`, 1 for valid frames
///
/// Each example contributes the mean over its valid region. Examples with an
/// empty mask are excluded from the batch mean instead of dividing by zero.
pub fn masked_mel_l1_loss(target: &Array, generated: &Array, mask: &Array) -> Result<MaskedLoss> {
    check_shapes(target, generated)?;
    let batch = target.dim(0);
    let n_mels = target.dim(1);
    let frames = target.dim(2);
    if mask.ndim() != 2 || mask.dim(0) != batch || mask.dim(1) != frames {
        return Err(VocoderError::ShapeMismatch {
            expected: vec![batch, frames],
            actual: mask.shape().to_vec(),
        });
    }

    let one = Array::from_f32(1.0);
    let mask3 = mask.reshape(&[batch, 1, frames])?;

    // [B]
    let abs_sum = target
        .subtract(generated)?
        .abs()?
        .multiply(&mask3)?
        .sum_axes(&[1, 2], Some(false))?;
    let frame_counts = mask.sum_axes(&[1], Some(false))?;
    let per_example = abs_sum.divide(
        &mlx_rs::ops::maximum(&frame_counts, &one)?.multiply(&Array::from_int(n_mels))?,
    )?;

    let valid = frame_counts.gt(&Array::from_f32(0.0))?.as_dtype(mlx_rs::Dtype::Float32)?;
    let valid_examples = valid.sum(None)?;
    let loss = per_example
        .multiply(&valid)?
        .sum(None)?
        .divide(&mlx_rs::ops::maximum(&valid_examples, &one)?)?;

    Ok(MaskedLoss {
        loss,
        valid_examples,
    })
}

/// KL divergence between a posterior `N(z_p; m_q, exp(logs_q))` sample and a
/// prior `N(m_p, exp(logs_p))`, averaged over the masked region.
///
/// All inputs are `[batch, channels, frames]`; `mask` is `[batch, 1, frames]`.
pub fn kl_loss(
    z_p: &Array,
    logs_q: &Array,
    m_p: &Array,
    logs_p: &Array,
    mask: &Array,
) -> Result<Array> {
    let diff = z_p.subtract(m_p)?;
    let inv_var = logs_p.multiply(&Array::from_f32(-2.0))?.exp()?;

    let kl = logs_p
        .subtract(logs_q)?
        .subtract(&Array::from_f32(0.5))?
        .add(&diff.multiply(&diff)?.multiply(&inv_var)?.multiply(&Array::from_f32(0.5))?)?;

    let total = kl.multiply(mask)?.sum(None)?;
    let count = mlx_rs::ops::maximum(&mask.sum(None)?, &Array::from_f32(1.0))?;
    Ok(total.divide(&count)?)
}

fn check_pairing(real: usize, generated: usize) -> Result<()> {
    if real != generated {
        return Err(VocoderError::ShapeMismatch {
            expected: vec![real as i32],
            actual: vec![generated as i32],
        });
    }
    Ok(())
}

fn check_shapes(target: &Array, generated: &Array) -> Result<()> {
    if target.shape() != generated.shape() {
        return Err(VocoderError::ShapeMismatch {
            expected: target.shape().to_vec(),
            actual: generated.shape().to_vec(),
        });
    }
    Ok(())
}
