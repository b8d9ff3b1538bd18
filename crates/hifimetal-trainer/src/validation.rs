//! Validation flow: masked mel reconstruction loss and example export.

use hifimetal_core::{MetricReducer, MetricSink, SpectrogramImage};
use hifimetal_vocoder::loss::masked_mel_l1_loss;
use hifimetal_vocoder::{FeaturePipeline, Generator};
use mlx_rs::{ops::indexing::IndexOp, Array};

use crate::batch::AudioBatch;
use crate::metrics::MeanMetric;
use crate::segment::sequence_mask;
use crate::Result;

/// Result of one validation batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationStepOutput {
    /// Masked mel L1 of the batch.
    pub loss: f64,
    /// Examples with a non-empty mask.
    pub valid_examples: usize,
    /// Examples exported to the sink.
    pub exported: usize,
}

/// Validation state: the running mel loss and export settings.
#[derive(Debug, Clone)]
pub struct Validator {
    metric: MeanMetric,
    max_examples: usize,
    sample_rate: u32,
}

impl Validator {
    pub fn new(max_examples: usize, sample_rate: u32) -> Self {
        Self {
            metric: MeanMetric::new(),
            max_examples,
            sample_rate,
        }
    }

    /// Running accumulator of the current epoch.
    pub fn metric(&self) -> &MeanMetric {
        &self.metric
    }

    /// Score one validation batch and export its first examples.
    ///
    /// The generator runs without gradient tracking. The target mel goes
    /// through the linear spectrogram path, the generated mel through the
    /// plain extractor, and both are trimmed to a common frame count before
    /// the masked L1 is taken. A batch whose masks are all empty leaves the
    /// running mean untouched.
    pub fn validation_step(
        &mut self,
        generator: &Generator,
        pipeline: &FeaturePipeline,
        batch: &AudioBatch,
        sink: &mut dyn MetricSink,
        step: usize,
    ) -> Result<ValidationStepOutput> {
        let hop = pipeline.hop_length();
        let x_mel = mlx_rs::stop_gradient(&pipeline.mel(&batch.conditioning_waveform)?)?;
        let mel_lengths = batch.mel_lengths(hop);

        let y_hat = mlx_rs::stop_gradient(&generator.forward(&x_mel)?)?;
        let y_spec = pipeline.spectrogram(&batch.target_waveform)?;
        let y_mel = pipeline.spec_to_mel(&y_spec)?;
        let y_hat_mel = pipeline.mel(&y_hat)?;

        let frames = y_mel.dim(2).min(y_hat_mel.dim(2));
        let y_mel = y_mel.index((.., .., ..frames));
        let y_hat_mel = y_hat_mel.index((.., .., ..frames));

        let clipped: Vec<i32> = mel_lengths.iter().map(|&l| l.clamp(0, frames)).collect();
        let mask = sequence_mask(&clipped, frames);
        let masked = masked_mel_l1_loss(&y_mel, &y_hat_mel, &mask)?;
        masked.loss.eval()?;
        masked.valid_examples.eval()?;

        let loss = masked.loss.item::<f32>() as f64;
        let valid_examples = masked.valid_examples.item::<f32>() as usize;
        if valid_examples > 0 {
            self.metric.update(loss);
            sink.record_scalar("valid/loss_mel_step", loss, step);
        } else {
            tracing::debug!(step, "Validation batch has no valid frames");
        }

        let exported = self.export_examples(
            sink,
            step,
            &y_hat_mel,
            &y_mel,
            &y_hat,
            batch,
        );

        Ok(ValidationStepOutput {
            loss,
            valid_examples,
            exported,
        })
    }

    /// Reduce the epoch mean across processes, log it and reset.
    pub fn validation_epoch_end(
        &mut self,
        reducer: &dyn MetricReducer,
        sink: &mut dyn MetricSink,
        step: usize,
    ) -> Result<Option<f64>> {
        let value = self.metric.compute(reducer)?;
        match value {
            Some(v) => sink.record_scalar("valid/loss_mel_epoch", v, step),
            None => tracing::warn!("Validation epoch ended without any valid example"),
        }
        self.metric.reset();
        Ok(value)
    }

    /// Export up to `max_examples` examples. Failures are logged, never raised.
    fn export_examples(
        &self,
        sink: &mut dyn MetricSink,
        step: usize,
        y_hat_mel: &Array,
        y_mel: &Array,
        y_hat: &Array,
        batch: &AudioBatch,
    ) -> usize {
        let count = self.max_examples.min(batch.batch_size() as usize);
        let mut exported = 0;
        for i in 0..count {
            match self.export_example(sink, step, i, y_hat_mel, y_mel, y_hat, batch) {
                Ok(()) => exported += 1,
                Err(e) => tracing::warn!(example = i, error = %e, "Skipping validation example"),
            }
        }
        exported
    }

    fn export_example(
        &self,
        sink: &mut dyn MetricSink,
        step: usize,
        i: usize,
        y_hat_mel: &Array,
        y_mel: &Array,
        y_hat: &Array,
        batch: &AudioBatch,
    ) -> Result<()> {
        let row = i as i32;
        sink.record_image(
            &format!("valid_example_{}/y_(gen)_mel", i),
            &to_image(&y_hat_mel.index(row))?,
            step,
        );
        sink.record_image(
            &format!("valid_example_{}/x_(gt)_mel", i),
            &to_image(&y_mel.index(row))?,
            step,
        );

        let generated = to_samples(&y_hat.index((row, 0, ..)))?;
        sink.record_audio(
            &format!("valid_example_{}/y_(gen)_audio", i),
            &generated,
            self.sample_rate,
            step,
        );

        let len = batch.target_lengths[i];
        let ground_truth = to_samples(&batch.target_waveform.index((row, 0, ..len)))?;
        sink.record_audio(
            &format!("valid_example_{}/y_(gt)_audio_", i),
            &ground_truth,
            self.sample_rate,
            step,
        );
        Ok(())
    }
}

/// Copy a `[height, width]` array into a spectrogram image.
fn to_image(mel: &Array) -> Result<SpectrogramImage> {
    let (height, width) = (mel.dim(0) as usize, mel.dim(1) as usize);
    let data = to_samples(mel)?;
    SpectrogramImage::new(data, height, width).ok_or_else(|| {
        crate::TrainerError::Config(format!("mel of {} values is not {}x{}", mel.size(), height, width))
    })
}

fn to_samples(x: &Array) -> Result<Vec<f32>> {
    if x.size() == 0 {
        return Ok(Vec::new());
    }
    let flat = x.reshape(&[-1])?;
    flat.eval()?;
    Ok(flat.as_slice::<f32>().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::RecordingSink;
    use crate::config::HifiGanConfig;
    use hifimetal_core::LocalReducer;

    fn setup() -> (Generator, FeaturePipeline, HifiGanConfig) {
        let config = HifiGanConfig::tiny();
        let generator =
            Generator::for_hop(&config.model.generator, config.data.hop_length).unwrap();
        let pipeline = FeaturePipeline::new(&config.data, &config.augment, 0).unwrap();
        (generator, pipeline, config)
    }

    fn noise_batch(batch: i32, samples: i32, lengths: Vec<i32>) -> AudioBatch {
        let wav = mlx_rs::random::uniform::<_, f32>(-0.5, 0.5, &[batch, 1, samples], None).unwrap();
        AudioBatch::paired(wav, lengths).unwrap()
    }

    #[test]
    fn test_step_exports_capped_examples() {
        let (generator, pipeline, _) = setup();
        let mut validator = Validator::new(2, 16000);
        let mut sink = RecordingSink::new();

        let batch = noise_batch(3, 1024, vec![1024, 512, 768]);
        let out = validator
            .validation_step(&generator, &pipeline, &batch, &mut sink, 7)
            .unwrap();

        assert_eq!(out.valid_examples, 3);
        assert_eq!(out.exported, 2);
        assert!(out.loss >= 0.0);
        assert!(sink.has_tag("valid/loss_mel_step"));
        assert!(sink.has_tag("valid_example_1/y_(gen)_mel"));
        assert!(sink.has_tag("valid_example_1/x_(gt)_mel"));
        assert!(sink.has_tag("valid_example_1/y_(gen)_audio"));
        assert!(sink.has_tag("valid_example_1/y_(gt)_audio_"));
        assert!(!sink.has_tag("valid_example_2/y_(gen)_mel"));

        let gt = sink
            .audio
            .iter()
            .find(|(t, _, _, _)| t == "valid_example_1/y_(gt)_audio_")
            .unwrap();
        assert_eq!(gt.1.len(), 512);
        let generated = sink
            .audio
            .iter()
            .find(|(t, _, _, _)| t == "valid_example_1/y_(gen)_audio")
            .unwrap();
        assert_eq!(generated.1.len(), 1024);
    }

    #[test]
    fn test_ground_truth_image_is_target_mel() {
        let (generator, pipeline, _) = setup();
        let mut validator = Validator::new(1, 16000);
        let mut sink = RecordingSink::new();

        let conditioning =
            mlx_rs::random::uniform::<_, f32>(-0.5, 0.5, &[1, 1, 512], None).unwrap();
        let target = mlx_rs::ops::zeros::<f32>(&[1, 1, 512]).unwrap();
        let batch = AudioBatch::new(conditioning, vec![512], target.clone(), vec![512]).unwrap();
        validator
            .validation_step(&generator, &pipeline, &batch, &mut sink, 0)
            .unwrap();

        let expected = pipeline
            .spec_to_mel(&pipeline.spectrogram(&target).unwrap())
            .unwrap();
        let expected = to_samples(&expected.index(0)).unwrap();
        let image = &sink
            .images
            .iter()
            .find(|(t, _, _)| t == "valid_example_0/x_(gt)_mel")
            .unwrap()
            .1;
        assert_eq!(image.data.len(), expected.len());
        for (a, b) in image.data.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_epoch_end_reduces_and_resets() {
        let (generator, pipeline, _) = setup();
        let mut validator = Validator::new(0, 16000);
        let mut sink = RecordingSink::new();

        for step in 0..2 {
            let batch = noise_batch(2, 512, vec![512, 512]);
            validator
                .validation_step(&generator, &pipeline, &batch, &mut sink, step)
                .unwrap();
        }
        let steps = sink.scalar_values("valid/loss_mel_step");
        let expected = (steps[0] + steps[1]) / 2.0;

        let epoch = validator
            .validation_epoch_end(&LocalReducer, &mut sink, 2)
            .unwrap()
            .unwrap();
        assert!((epoch - expected).abs() < 1e-9);
        assert_eq!(sink.scalar_values("valid/loss_mel_epoch"), vec![epoch]);
        assert_eq!(validator.metric().count(), 0.0);
    }

    #[test]
    fn test_all_empty_batch_skips_metric() {
        let (generator, pipeline, _) = setup();
        let mut validator = Validator::new(1, 16000);
        let mut sink = RecordingSink::new();

        let batch = noise_batch(2, 512, vec![0, 32]);
        let out = validator
            .validation_step(&generator, &pipeline, &batch, &mut sink, 0)
            .unwrap();

        assert_eq!(out.valid_examples, 0);
        assert_eq!(out.loss, 0.0);
        assert_eq!(validator.metric().count(), 0.0);
        assert!(sink.scalar_values("valid/loss_mel_step").is_empty());
        assert_eq!(
            validator
                .validation_epoch_end(&LocalReducer, &mut sink, 0)
                .unwrap(),
            None
        );
    }
}
