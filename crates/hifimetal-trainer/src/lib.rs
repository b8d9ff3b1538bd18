//! Adversarial training orchestration for hifimetal vocoders.
//!
//! This crate drives a generator against an ensemble of discriminators:
//!
//! - Segment sampling that keeps mel frames and waveform samples aligned
//! - A two-phase step (discriminator update, then generator update)
//! - Validation with a masked mel loss reduced across processes
//! - Checkpoints that survive architecture changes
//! - Metric sinks for tracing, JSONL and TensorBoard output
//!
//! # Example
//!
//! ```ignore
//! use hifimetal_trainer::{GanTrainer, HifiGanConfig, CheckpointManager};
//!
//! let config = HifiGanConfig::from_file("run.yaml")?;
//! let mut trainer = GanTrainer::new(&config)?
//!     .with_checkpoint_manager(CheckpointManager::new("checkpoints")?);
//! let history = trainer.fit(&train_batches, &valid_batches)?;
//! ```

// Crate-level lint configuration for ML/GPU code patterns
#![allow(missing_docs)]
#![allow(clippy::too_many_arguments)]

pub mod batch;
pub mod callbacks;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod gan;
pub mod metrics;
pub mod reconcile;
pub mod segment;
pub mod validation;

pub use batch::AudioBatch;
pub use callbacks::{CompositeSink, JsonlSink, NullSink, ProgressSink, RecordingSink, TracingSink};
#[cfg(feature = "tensorboard")]
pub use callbacks::TensorBoardSink;
pub use checkpoint::{CheckpointManager, CheckpointMetadata, CheckpointState, ResumeState};
pub use config::HifiGanConfig;
pub use error::{Phase, Result, TrainerError};
pub use gan::{GanTrainer, PreparedStep, StepOutcome};
pub use metrics::MeanMetric;
pub use reconcile::{reconcile, ReconcileReport, Reconciliation};
pub use segment::{sequence_mask, slice_segments, SegmentSample, SegmentSampler};
pub use validation::{ValidationStepOutput, Validator};
