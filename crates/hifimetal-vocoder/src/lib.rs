//! HiFi-GAN style neural vocoder components on MLX.
//!
//! This crate holds everything the adversarial trainer differentiates through
//! or against:
//!
//! - A frozen feature pipeline turning waveforms into log-mel spectrograms
//! - A mel-conditioned generator built from transposed convolutions and
//!   dilated residual blocks
//! - Multi-period and multi-scale discriminators
//! - The loss terms of both players
//!
//! # Example
//!
//! ```ignore
//! use hifimetal_vocoder::{Generator, GeneratorConfig, FeaturePipeline};
//!
//! let generator = Generator::new(&GeneratorConfig::v1_48khz())?;
//! let audio = generator.forward(&mel)?; // [batch, 1, frames * hop]
//! ```

// Crate-level lint configuration for ML/GPU code patterns
#![allow(missing_docs)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_borrows_for_generic_args)]

pub mod audio;
pub mod config;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod loss;
pub mod nn;
pub mod pipeline;

pub use config::*;
pub use discriminator::{
    Discriminator, DiscriminatorEnsemble, DiscriminatorOutput, MultiPeriodDiscriminator,
    MultiScaleDiscriminator, ScoreTuple,
};
pub use error::*;
pub use generator::Generator;
pub use pipeline::FeaturePipeline;
