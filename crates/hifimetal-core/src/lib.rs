//! Core types, traits, and configuration for hifimetal vocoder training.
//!
//! This crate provides the foundational pieces shared by the vocoder and
//! trainer crates:
//!
//! - Configuration groups for audio framing, optimization and augmentation
//! - Error handling infrastructure
//! - The per-epoch exponential learning rate schedule
//! - Metric sink and metric reduction traits

#![warn(missing_docs)]

mod config;
mod error;
pub mod scheduler;
mod traits;
mod types;

pub use config::*;
pub use error::*;
pub use scheduler::ExponentialLr;
pub use traits::*;
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{CoreError, Result};
    pub use crate::scheduler::ExponentialLr;
    pub use crate::traits::*;
    pub use crate::types::*;
}
