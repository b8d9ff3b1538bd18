//! Training checkpoint save/load functionality.
//!
//! A checkpoint is a directory `epoch_{n}` holding:
//! - `model.safetensors`: generator and discriminator parameters, prefixed
//!   `generator.` and `discriminator.`
//! - `optimizer_g.safetensors` / `optimizer_d.safetensors`: AdamW first and
//!   second moments (`{param}.m`, `{param}.v`), when any update has happened
//! - `metadata.json`: progress counters, learning rates and the run config
//!
//! The manager keeps a `latest` marker file, a copy of the best checkpoint in
//! `best/`, and rotates old epoch directories.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlx_rs::module::ModuleParameters;
use mlx_rs::optimizers::AdamW;
use mlx_rs::Array;
use serde::{Deserialize, Serialize};

use crate::reconcile::{reconcile, ReconcileReport};
use crate::{Result, TrainerError};

/// Key prefix of generator parameters in a checkpoint.
pub const GENERATOR_PREFIX: &str = "generator.";
/// Key prefix of discriminator parameters in a checkpoint.
pub const DISCRIMINATOR_PREFIX: &str = "discriminator.";

const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_G_FILE: &str = "optimizer_g.safetensors";
const OPTIMIZER_D_FILE: &str = "optimizer_d.safetensors";
const METADATA_FILE: &str = "metadata.json";

/// Training state metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Epoch training resumes at (number of completed epochs).
    pub epoch: usize,
    /// Optimizer steps taken.
    pub step: usize,
    /// Best validation mel loss seen.
    pub best_val_loss: Option<f64>,
    /// Generator learning rate at checkpoint.
    pub generator_learning_rate: f64,
    /// Discriminator learning rate at checkpoint.
    pub discriminator_learning_rate: f64,
    /// Run configuration as JSON.
    pub config: Option<String>,
    /// Random seed used.
    pub seed: u64,
    /// Timestamp (RFC 3339).
    pub timestamp: String,
}

impl CheckpointMetadata {
    /// Create new metadata for the current training state.
    pub fn new(epoch: usize, step: usize, generator_lr: f64, discriminator_lr: f64) -> Self {
        Self {
            epoch,
            step,
            best_val_loss: None,
            generator_learning_rate: generator_lr,
            discriminator_learning_rate: discriminator_lr,
            config: None,
            seed: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_best_val_loss(mut self, loss: f64) -> Self {
        self.best_val_loss = Some(loss);
        self
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Everything a checkpoint directory holds.
#[derive(Debug, Clone)]
pub struct CheckpointState {
    /// Prefixed model parameters.
    pub params: HashMap<Rc<str>, Array>,
    /// Generator optimizer moments.
    pub optimizer_g: Option<HashMap<Rc<str>, Array>>,
    /// Discriminator optimizer moments.
    pub optimizer_d: Option<HashMap<Rc<str>, Array>>,
    pub metadata: CheckpointMetadata,
}

/// State ready to be applied to a trainer after reconciliation.
#[derive(Debug, Clone)]
pub struct ResumeState {
    /// Prefixed model parameters, compatible with the current models.
    pub params: HashMap<Rc<str>, Array>,
    /// Generator optimizer moments, `None` when discarded.
    pub optimizer_g: Option<HashMap<Rc<str>, Array>>,
    /// Discriminator optimizer moments, `None` when discarded.
    pub optimizer_d: Option<HashMap<Rc<str>, Array>>,
    /// Epoch to resume at.
    pub epoch: usize,
    pub step: usize,
    pub best_val_loss: Option<f64>,
    /// Whether the checkpoint had to be patched.
    pub changed: bool,
    pub report: ReconcileReport,
}

impl ResumeState {
    /// Reconcile a loaded checkpoint with the current model state.
    ///
    /// Optimizer moments are dropped when any parameter was dropped or
    /// replaced. Progress counters are kept either way.
    pub fn from_checkpoint(checkpoint: CheckpointState, current: &HashMap<Rc<str>, Array>) -> Self {
        let reconciled = reconcile(checkpoint.params, current);
        let (optimizer_g, optimizer_d) = if reconciled.changed {
            tracing::info!("Discarding optimizer state of a patched checkpoint");
            (None, None)
        } else {
            (checkpoint.optimizer_g, checkpoint.optimizer_d)
        };

        Self {
            params: reconciled.state,
            optimizer_g,
            optimizer_d,
            epoch: checkpoint.metadata.epoch,
            step: checkpoint.metadata.step,
            best_val_loss: checkpoint.metadata.best_val_loss,
            changed: reconciled.changed,
            report: reconciled.report,
        }
    }
}

/// Snapshot a module's parameters under a key prefix.
pub fn prefixed_parameters<M: ModuleParameters>(
    module: &M,
    prefix: &str,
) -> HashMap<Rc<str>, Array> {
    module
        .parameters()
        .flatten()
        .into_iter()
        .map(|(k, v)| (Rc::from(format!("{}{}", prefix, k)), v.clone()))
        .collect()
}

/// Overwrite a module's parameters with the entries of `state` under `prefix`.
///
/// Returns the number of parameters written. Parameters without an entry are
/// left untouched.
pub fn apply_parameters<M: ModuleParameters>(
    module: &mut M,
    prefix: &str,
    state: &HashMap<Rc<str>, Array>,
) -> usize {
    let mut applied = 0;
    for (key, param) in module.parameters_mut().flatten() {
        if let Some(value) = state.get(format!("{}{}", prefix, key).as_str()) {
            *param = value.clone();
            applied += 1;
        }
    }
    applied
}

/// Flatten AdamW moments to `{param}.m` / `{param}.v` entries.
pub fn optimizer_state(optimizer: &AdamW) -> HashMap<Rc<str>, Array> {
    let mut out = HashMap::with_capacity(optimizer.state.len() * 2);
    for (key, (m, v)) in optimizer.state.iter() {
        out.insert(Rc::from(format!("{}.m", key)), m.clone());
        out.insert(Rc::from(format!("{}.v", key)), v.clone());
    }
    out
}

/// Restore AdamW moments written by [`optimizer_state`].
///
/// Entries missing either moment are skipped. Returns the number of restored
/// parameters.
pub fn restore_optimizer_state(optimizer: &mut AdamW, state: &HashMap<Rc<str>, Array>) -> usize {
    optimizer.state.clear();
    for (key, m) in state {
        let Some(param) = key.strip_suffix(".m") else {
            continue;
        };
        if let Some(v) = state.get(format!("{}.v", param).as_str()) {
            optimizer
                .state
                .insert(Rc::from(param), (m.clone(), v.clone()));
        }
    }
    optimizer.state.len()
}

/// Checkpoint manager for saving and loading training state.
#[derive(Debug)]
pub struct CheckpointManager {
    /// Base directory for checkpoints.
    checkpoint_dir: PathBuf,
    /// Maximum number of checkpoints to keep (None = unlimited).
    max_checkpoints: Option<usize>,
    /// Save best model separately.
    save_best: bool,
}

impl CheckpointManager {
    /// Create a new checkpoint manager.
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoint_dir)?;

        Ok(Self {
            checkpoint_dir,
            max_checkpoints: Some(5),
            save_best: true,
        })
    }

    /// Set maximum number of checkpoints to keep.
    pub fn with_max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = Some(max);
        self
    }

    /// Set whether to save best model separately.
    pub fn with_save_best(mut self, save_best: bool) -> Self {
        self.save_best = save_best;
        self
    }

    /// Save a training checkpoint.
    ///
    /// # Arguments
    /// * `state` - Parameters, optimizer moments and metadata
    /// * `is_best` - Whether this is the best checkpoint so far
    pub fn save_checkpoint(&self, state: &CheckpointState, is_best: bool) -> Result<PathBuf> {
        let epoch_dir = self
            .checkpoint_dir
            .join(format!("epoch_{}", state.metadata.epoch));
        write_checkpoint_dir(&epoch_dir, state)?;

        self.update_latest_marker(state.metadata.epoch)?;

        if is_best && self.save_best {
            write_checkpoint_dir(&self.checkpoint_dir.join("best"), state)?;
            tracing::info!(epoch = state.metadata.epoch, "Saved best checkpoint");
        }

        self.cleanup_old_checkpoints()?;

        tracing::info!(
            epoch = state.metadata.epoch,
            step = state.metadata.step,
            path = ?epoch_dir,
            "Saved checkpoint"
        );
        Ok(epoch_dir)
    }

    fn update_latest_marker(&self, epoch: usize) -> Result<()> {
        // plain file instead of a symlink
        fs::write(
            self.checkpoint_dir.join("latest"),
            format!("epoch_{}", epoch),
        )?;
        Ok(())
    }

    /// Clean up old checkpoints, keeping only the most recent ones.
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let Some(max) = self.max_checkpoints else {
            return Ok(());
        };

        let mut epoch_dirs = self.list_checkpoints()?;
        while epoch_dirs.len() > max {
            let (epoch, path) = epoch_dirs.remove(0);
            if let Err(e) = fs::remove_dir_all(&path) {
                tracing::warn!("Failed to remove old checkpoint {}: {}", epoch, e);
            } else {
                tracing::debug!("Removed old checkpoint at epoch {}", epoch);
            }
        }
        Ok(())
    }

    /// Load a checkpoint from a directory.
    pub fn load_checkpoint<P: AsRef<Path>>(checkpoint_path: P) -> Result<CheckpointState> {
        let checkpoint_path = checkpoint_path.as_ref();

        let params = load_tensors(&checkpoint_path.join(MODEL_FILE))?;
        let optimizer_g = load_optional_tensors(&checkpoint_path.join(OPTIMIZER_G_FILE))?;
        let optimizer_d = load_optional_tensors(&checkpoint_path.join(OPTIMIZER_D_FILE))?;

        let metadata_json = fs::read_to_string(checkpoint_path.join(METADATA_FILE))?;
        let metadata: CheckpointMetadata = serde_json::from_str(&metadata_json)
            .map_err(|e| TrainerError::Checkpoint(format!("Failed to parse metadata: {}", e)))?;

        tracing::info!(
            epoch = metadata.epoch,
            step = metadata.step,
            path = ?checkpoint_path,
            "Loaded checkpoint"
        );

        Ok(CheckpointState {
            params,
            optimizer_g,
            optimizer_d,
            metadata,
        })
    }

    /// Load the latest checkpoint.
    pub fn load_latest(&self) -> Result<Option<CheckpointState>> {
        let latest_path = self.checkpoint_dir.join("latest");
        if !latest_path.exists() {
            return Ok(None);
        }

        let name = fs::read_to_string(&latest_path)?;
        let checkpoint_path = self.checkpoint_dir.join(name.trim());
        if checkpoint_path.exists() {
            Self::load_checkpoint(&checkpoint_path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Load the best checkpoint.
    pub fn load_best(&self) -> Result<Option<CheckpointState>> {
        let best_path = self.checkpoint_dir.join("best");
        if best_path.exists() {
            Self::load_checkpoint(&best_path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// List all available checkpoints, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut checkpoints: Vec<(usize, PathBuf)> = fs::read_dir(&self.checkpoint_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let epoch = name.strip_prefix("epoch_")?.parse::<usize>().ok()?;
                Some((epoch, entry.path()))
            })
            .collect();

        checkpoints.sort_by_key(|(epoch, _)| *epoch);
        Ok(checkpoints)
    }

    /// Get the checkpoint directory.
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }
}

/// Write a full checkpoint into `dir`, creating it if needed.
pub fn write_checkpoint_dir(dir: &Path, state: &CheckpointState) -> Result<()> {
    fs::create_dir_all(dir)?;

    save_tensors(&state.params, &dir.join(MODEL_FILE))?;
    for (file, moments) in [
        (OPTIMIZER_G_FILE, &state.optimizer_g),
        (OPTIMIZER_D_FILE, &state.optimizer_d),
    ] {
        let path = dir.join(file);
        match moments {
            Some(m) if !m.is_empty() => save_tensors(m, &path)?,
            // a stale file would resurrect discarded moments on the next load
            _ if path.exists() => fs::remove_file(&path)?,
            _ => {}
        }
    }

    let metadata_json = serde_json::to_string_pretty(&state.metadata)
        .map_err(|e| TrainerError::Checkpoint(format!("Failed to serialize metadata: {}", e)))?;
    fs::write(dir.join(METADATA_FILE), metadata_json)?;
    Ok(())
}

fn save_tensors(tensors: &HashMap<Rc<str>, Array>, path: &Path) -> Result<()> {
    Array::save_safetensors(tensors.clone(), None, path)
        .map_err(|e| TrainerError::Checkpoint(format!("Failed to save {:?}: {}", path, e)))
}

fn load_tensors(path: &Path) -> Result<HashMap<Rc<str>, Array>> {
    let tensors = Array::load_safetensors(path)
        .map_err(|e| TrainerError::Checkpoint(format!("Failed to load {:?}: {}", path, e)))?;
    Ok(tensors
        .into_iter()
        .map(|(k, v)| (Rc::from(k), v))
        .collect())
}

fn load_optional_tensors(path: &Path) -> Result<Option<HashMap<Rc<str>, Array>>> {
    if path.exists() {
        load_tensors(path).map(Some)
    } else {
        Ok(None)
    }
}
