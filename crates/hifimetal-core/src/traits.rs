//! Core trait definitions.

use crate::{EpochMetrics, Result, SpectrogramImage};

/// Destination for training and validation metrics.
///
/// Implementations may fail (a full disk, a closed writer), but a failing sink
/// must never fail a training step. Callers go through the `record_*` methods,
/// which log the failure and carry on.
pub trait MetricSink {
    /// Log a scalar value under `tag`.
    fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;

    /// Log a spectrogram image under `tag`.
    fn log_image(&mut self, _tag: &str, _image: &SpectrogramImage, _step: usize) -> Result<()> {
        Ok(())
    }

    /// Log a mono audio clip under `tag`.
    fn log_audio(
        &mut self,
        _tag: &str,
        _samples: &[f32],
        _sample_rate: u32,
        _step: usize,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once at the end of every epoch.
    fn on_epoch_end(&mut self, _metrics: &EpochMetrics) -> Result<()> {
        Ok(())
    }

    /// Flush buffered records.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Log a scalar, swallowing sink failures.
    fn record_scalar(&mut self, tag: &str, value: f64, step: usize) {
        if let Err(e) = self.log_scalar(tag, value, step) {
            tracing::warn!(tag, step, error = %e, "Dropping scalar metric");
        }
    }

    /// Log an image, swallowing sink failures.
    fn record_image(&mut self, tag: &str, image: &SpectrogramImage, step: usize) {
        if let Err(e) = self.log_image(tag, image, step) {
            tracing::warn!(tag, step, error = %e, "Dropping image metric");
        }
    }

    /// Log audio, swallowing sink failures.
    fn record_audio(&mut self, tag: &str, samples: &[f32], sample_rate: u32, step: usize) {
        if let Err(e) = self.log_audio(tag, samples, sample_rate, step) {
            tracing::warn!(tag, step, error = %e, "Dropping audio metric");
        }
    }
}

impl<S: MetricSink + ?Sized> MetricSink for Box<S> {
    fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        (**self).log_scalar(tag, value, step)
    }

    fn log_image(&mut self, tag: &str, image: &SpectrogramImage, step: usize) -> Result<()> {
        (**self).log_image(tag, image, step)
    }

    fn log_audio(&mut self, tag: &str, samples: &[f32], sample_rate: u32, step: usize) -> Result<()> {
        (**self).log_audio(tag, samples, sample_rate, step)
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics) -> Result<()> {
        (**self).on_epoch_end(metrics)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Cross-process reduction of metric accumulators.
///
/// Data-parallel runs sum per-process partial statistics before computing an
/// epoch mean. The transport itself lives outside this workspace.
pub trait MetricReducer {
    /// Element-wise sum of `values` across all participating processes.
    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>>;

    /// Number of participating processes.
    fn world_size(&self) -> usize {
        1
    }
}

/// Single-process reducer: the reduction is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReducer;

impl MetricReducer for LocalReducer {
    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        Ok(values.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoreError;

    struct FailingSink {
        attempts: usize,
    }

    impl MetricSink for FailingSink {
        fn log_scalar(&mut self, _tag: &str, _value: f64, _step: usize) -> Result<()> {
            self.attempts += 1;
            Err(CoreError::Sink("disk full".into()))
        }
    }

    #[test]
    fn test_record_swallows_failures() {
        let mut sink = FailingSink { attempts: 0 };
        sink.record_scalar("train/d/loss_total", 1.0, 0);
        sink.record_scalar("train/g/loss_total", 2.0, 0);
        assert_eq!(sink.attempts, 2);
    }

    #[test]
    fn test_default_media_methods_are_noops() {
        let mut sink = FailingSink { attempts: 0 };
        let image = SpectrogramImage::new(vec![0.0; 4], 2, 2).unwrap();
        assert!(sink.log_image("img", &image, 0).is_ok());
        assert!(sink.log_audio("audio", &[0.0; 8], 16000, 0).is_ok());
    }

    #[test]
    fn test_boxed_sink_forwards() {
        let mut sink: Box<dyn MetricSink> = Box::new(FailingSink { attempts: 0 });
        assert!(sink.log_scalar("x", 0.0, 0).is_err());
    }

    #[test]
    fn test_local_reducer_is_identity() {
        let reducer = LocalReducer;
        assert_eq!(reducer.all_reduce_sum(&[1.5, 3.0]).unwrap(), vec![1.5, 3.0]);
        assert_eq!(reducer.world_size(), 1);
    }
}
