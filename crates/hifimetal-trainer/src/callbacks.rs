//! Metric sinks for monitoring and logging.
//!
//! - [`TracingSink`] - Scalar logging with tracing
//! - [`ProgressSink`] - Progress bar over optimizer steps
//! - [`JsonlSink`] - JSONL metrics file (Wandb-compatible import)
//! - [`TensorBoardSink`] - TensorBoard logging (requires `tensorboard` feature)
//! - [`CompositeSink`] - Fan-out to several sinks
//!
//! # Wandb Integration
//!
//! Write metrics with [`JsonlSink`], then import them using Wandb's offline sync:
//!
//! ```bash
//! wandb sync --include-offline --include-synced path/to/metrics.jsonl
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use hifimetal_core::{CoreError, EpochMetrics, MetricSink, SpectrogramImage};

type SinkResult = hifimetal_core::Result<()>;

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn log_scalar(&mut self, _tag: &str, _value: f64, _step: usize) -> SinkResult {
        Ok(())
    }
}

/// Logs scalars through `tracing` every `log_every` steps.
#[derive(Debug, Clone)]
pub struct TracingSink {
    log_every: usize,
}

impl TracingSink {
    pub fn new(log_every: usize) -> Self {
        Self {
            log_every: log_every.max(1),
        }
    }
}

impl MetricSink for TracingSink {
    fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> SinkResult {
        // epoch-level and validation scalars always go through
        if step % self.log_every == 0 || !tag.starts_with("train/") {
            tracing::info!(step, tag, value, "Metric");
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> SinkResult {
        tracing::info!(
            epoch = metrics.epoch,
            step = metrics.global_step,
            d_loss = metrics.discriminator_loss,
            g_loss = metrics.generator_loss,
            valid_mel = ?metrics.validation_mel_loss,
            aborted = metrics.aborted_steps,
            "Epoch complete"
        );
        Ok(())
    }
}

/// Progress bar over optimizer steps.
///
/// Shows the latest total generator loss next to the bar.
pub struct ProgressSink {
    progress: indicatif::ProgressBar,
}

impl ProgressSink {
    /// Create a progress bar for `total_steps` optimizer steps.
    pub fn new(total_steps: usize) -> Self {
        let progress = indicatif::ProgressBar::new(total_steps as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            progress.set_style(style.progress_chars("#>-"));
        }
        Self { progress }
    }

    /// Create a sink that draws nothing, for tests and non-interactive runs.
    pub fn hidden(total_steps: usize) -> Self {
        Self {
            progress: indicatif::ProgressBar::with_draw_target(
                Some(total_steps as u64),
                indicatif::ProgressDrawTarget::hidden(),
            ),
        }
    }

    pub fn position(&self) -> u64 {
        self.progress.position()
    }
}

impl MetricSink for ProgressSink {
    fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> SinkResult {
        if tag == "train/g/loss_total" {
            self.progress.set_position(step as u64 + 1);
            self.progress.set_message(format!("g_loss: {:.4}", value));
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> SinkResult {
        if let Some(valid) = metrics.validation_mel_loss {
            self.progress
                .set_message(format!("epoch {} valid mel: {:.4}", metrics.epoch, valid));
        }
        Ok(())
    }

    fn flush(&mut self) -> SinkResult {
        self.progress.tick();
        Ok(())
    }
}

impl Drop for ProgressSink {
    fn drop(&mut self) {
        self.progress.finish_with_message("Training complete!");
    }
}

/// JSONL metrics sink.
///
/// One JSON object per line:
///
/// ```json
/// {"tag": "train/g/loss_total", "value": 41.2, "step": 10, "timestamp": "2024-12-31T12:00:00Z"}
/// ```
///
/// Images and audio are recorded as summary statistics only.
pub struct JsonlSink {
    writer: BufWriter<File>,
    path: PathBuf,
    run_name: Option<String>,
}

impl JsonlSink {
    /// Create a new JSONL sink, truncating any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            run_name: None,
        })
    }

    /// Set an optional run name, written into every record.
    pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }

    /// Record the run configuration as the first line.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        let entry = serde_json::json!({
            "event": "train_start",
            "config": config,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.write_entry(entry) {
            tracing::warn!(error = %e, "Failed to write config record");
        }
        self
    }

    /// Get the path to the metrics file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entry(&mut self, mut entry: serde_json::Value) -> SinkResult {
        if let Some(ref name) = self.run_name {
            entry["run_name"] = serde_json::json!(name);
        }
        let line = serde_json::to_string(&entry)?;
        writeln!(self.writer, "{}", line)?;
        Ok(())
    }
}

impl MetricSink for JsonlSink {
    fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> SinkResult {
        if !value.is_finite() {
            return Err(CoreError::Sink(format!("{} is not finite: {}", tag, value)));
        }
        self.write_entry(serde_json::json!({
            "tag": tag,
            "value": value,
            "step": step,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))?;

        if step % 10 == 0 {
            self.writer.flush()?;
        }
        Ok(())
    }

    fn log_image(&mut self, tag: &str, image: &SpectrogramImage, step: usize) -> SinkResult {
        let (min, max) = image.value_range().unwrap_or((0.0, 0.0));
        self.write_entry(serde_json::json!({
            "tag": tag,
            "kind": "image",
            "height": image.height,
            "width": image.width,
            "min": min,
            "max": max,
            "step": step,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }

    fn log_audio(&mut self, tag: &str, samples: &[f32], sample_rate: u32, step: usize) -> SinkResult {
        let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        let rms = if samples.is_empty() {
            0.0
        } else {
            (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
        };
        self.write_entry(serde_json::json!({
            "tag": tag,
            "kind": "audio",
            "sample_rate": sample_rate,
            "num_samples": samples.len(),
            "peak": peak,
            "rms": rms,
            "step": step,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> SinkResult {
        let mut entry = serde_json::to_value(metrics)?;
        entry["event"] = serde_json::json!("epoch_end");
        entry["timestamp"] = serde_json::json!(chrono::Utc::now().to_rfc3339());
        self.write_entry(entry)?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> SinkResult {
        self.writer.flush()?;
        Ok(())
    }
}

/// TensorBoard sink.
///
/// View with `tensorboard --logdir <path>`. Requires the `tensorboard` feature:
///
/// ```toml
/// hifimetal-trainer = { version = "0.1", features = ["tensorboard"] }
/// ```
#[cfg(feature = "tensorboard")]
pub struct TensorBoardSink {
    writer: tensorboard_rs::summary_writer::SummaryWriter,
    log_dir: PathBuf,
}

#[cfg(feature = "tensorboard")]
impl TensorBoardSink {
    /// Create a new TensorBoard sink writing event files to `log_dir`.
    pub fn new(log_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)?;

        let writer =
            tensorboard_rs::summary_writer::SummaryWriter::new(&log_dir.display().to_string());
        tracing::info!(log_dir = %log_dir.display(), "TensorBoard logging started");

        Ok(Self { writer, log_dir })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

#[cfg(feature = "tensorboard")]
impl MetricSink for TensorBoardSink {
    fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> SinkResult {
        self.writer.add_scalar(tag, value as f32, step);
        Ok(())
    }

    fn log_image(&mut self, tag: &str, image: &SpectrogramImage, step: usize) -> SinkResult {
        let Some((lo, hi)) = image.value_range() else {
            return Ok(());
        };
        let scale = if hi > lo { 255.0 / (hi - lo) } else { 0.0 };
        // flip rows so low mel bands sit at the bottom
        let mut pixels = Vec::with_capacity(image.data.len());
        for row in (0..image.height).rev() {
            let start = row * image.width;
            pixels.extend(
                image.data[start..start + image.width]
                    .iter()
                    .map(|v| ((v - lo) * scale) as u8),
            );
        }
        self.writer
            .add_image(tag, &pixels, &[1, image.height, image.width], step);
        Ok(())
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> SinkResult {
        use std::collections::HashMap;

        let mut scalars = HashMap::new();
        scalars.insert("d_loss".to_string(), metrics.discriminator_loss as f32);
        scalars.insert("g_loss".to_string(), metrics.generator_loss as f32);
        if let Some(valid) = metrics.validation_mel_loss {
            scalars.insert("valid_mel".to_string(), valid as f32);
        }
        self.writer.add_scalars("epoch", &scalars, metrics.epoch);
        self.writer.flush();
        Ok(())
    }

    fn flush(&mut self) -> SinkResult {
        self.writer.flush();
        Ok(())
    }
}

/// Sink that forwards every record to multiple sinks.
///
/// A failing member does not stop the others; the first error is returned.
///
/// # Example
///
/// ```ignore
/// use hifimetal_trainer::callbacks::{CompositeSink, JsonlSink, TracingSink};
///
/// let mut composite = CompositeSink::new();
/// composite.add(Box::new(TracingSink::new(100)));
/// composite.add(Box::new(JsonlSink::new("metrics.jsonl")?));
/// ```
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Add a sink to the composite.
    pub fn add(&mut self, sink: Box<dyn MetricSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn forward(&mut self, mut f: impl FnMut(&mut dyn MetricSink) -> SinkResult) -> SinkResult {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = f(sink.as_mut()) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl MetricSink for CompositeSink {
    fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> SinkResult {
        self.forward(|s| s.log_scalar(tag, value, step))
    }

    fn log_image(&mut self, tag: &str, image: &SpectrogramImage, step: usize) -> SinkResult {
        self.forward(|s| s.log_image(tag, image, step))
    }

    fn log_audio(&mut self, tag: &str, samples: &[f32], sample_rate: u32, step: usize) -> SinkResult {
        self.forward(|s| s.log_audio(tag, samples, sample_rate, step))
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> SinkResult {
        self.forward(|s| s.on_epoch_end(metrics))
    }

    fn flush(&mut self) -> SinkResult {
        self.forward(|s| s.flush())
    }
}

/// In-memory sink recording every call, for inspecting what a run logged.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub scalars: Vec<(String, f64, usize)>,
    pub images: Vec<(String, SpectrogramImage, usize)>,
    pub audio: Vec<(String, Vec<f32>, u32, usize)>,
    pub epochs: Vec<EpochMetrics>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All values recorded under `tag`, in order.
    pub fn scalar_values(&self, tag: &str) -> Vec<f64> {
        self.scalars
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, v, _)| *v)
            .collect()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.scalars.iter().any(|(t, _, _)| t == tag)
            || self.images.iter().any(|(t, _, _)| t == tag)
            || self.audio.iter().any(|(t, _, _, _)| t == tag)
    }
}

impl MetricSink for RecordingSink {
    fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> SinkResult {
        self.scalars.push((tag.to_string(), value, step));
        Ok(())
    }

    fn log_image(&mut self, tag: &str, image: &SpectrogramImage, step: usize) -> SinkResult {
        self.images.push((tag.to_string(), image.clone(), step));
        Ok(())
    }

    fn log_audio(&mut self, tag: &str, samples: &[f32], sample_rate: u32, step: usize) -> SinkResult {
        self.audio
            .push((tag.to_string(), samples.to_vec(), sample_rate, step));
        Ok(())
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> SinkResult {
        self.epochs.push(metrics.clone());
        Ok(())
    }
}

/// Shared handle to a sink, so a caller can keep inspecting what the trainer
/// logged after handing it over.
pub struct SharedSink<S>(pub std::rc::Rc<std::cell::RefCell<S>>);

impl<S> Clone for SharedSink<S> {
    fn clone(&self) -> Self {
        Self(std::rc::Rc::clone(&self.0))
    }
}

impl<S: MetricSink> SharedSink<S> {
    pub fn new(sink: S) -> Self {
        Self(std::rc::Rc::new(std::cell::RefCell::new(sink)))
    }
}

impl<S: MetricSink> MetricSink for SharedSink<S> {
    fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> SinkResult {
        self.0.borrow_mut().log_scalar(tag, value, step)
    }

    fn log_image(&mut self, tag: &str, image: &SpectrogramImage, step: usize) -> SinkResult {
        self.0.borrow_mut().log_image(tag, image, step)
    }

    fn log_audio(&mut self, tag: &str, samples: &[f32], sample_rate: u32, step: usize) -> SinkResult {
        self.0.borrow_mut().log_audio(tag, samples, sample_rate, step)
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> SinkResult {
        self.0.borrow_mut().on_epoch_end(metrics)
    }

    fn flush(&mut self) -> SinkResult {
        self.0.borrow_mut().flush()
    }
}
