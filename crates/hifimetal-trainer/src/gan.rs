//! Adversarial vocoder trainer.
//!
//! Every step is an explicit two-state sequence:
//!
//! 1. [`Phase::Discriminator`]: the generator output is detached, the
//!    discriminator ensemble is differentiated on the least-squares
//!    discriminator loss and updated.
//! 2. [`Phase::Generator`]: the generator is differentiated on adversarial,
//!    feature matching and masked mel reconstruction terms, scored by the
//!    just-updated discriminators, and updated.
//!
//! Each phase differentiates only with respect to the module its optimizer
//! owns. Any failure before the discriminator update abandons the whole step.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use hifimetal_core::{EpochMetrics, ExponentialLr, LocalReducer, MetricReducer, MetricSink};
use hifimetal_vocoder::loss::{
    discriminator_loss, feature_matching_loss, generator_adversarial_loss, masked_mel_l1_loss,
    AdversarialLossOutput, DiscriminatorLossOutput,
};
use hifimetal_vocoder::{DiscriminatorEnsemble, FeaturePipeline, Generator};
use mlx_rs::{
    array,
    builder::Builder,
    error::Exception,
    module::{FlattenedModuleParam, ModuleParameters},
    nn,
    optimizers::{AdamW, AdamWBuilder, Optimizer},
    transforms::eval_params,
    Array,
};

use crate::batch::AudioBatch;
use crate::callbacks::TracingSink;
use crate::checkpoint::{
    apply_parameters, optimizer_state, prefixed_parameters, restore_optimizer_state,
    CheckpointManager, CheckpointMetadata, CheckpointState, ResumeState, DISCRIMINATOR_PREFIX,
    GENERATOR_PREFIX,
};
use crate::config::HifiGanConfig;
use crate::reconcile::ReconcileReport;
use crate::segment::{sequence_mask, slice_segments, SegmentSampler};
use crate::validation::{ValidationStepOutput, Validator};
use crate::{Phase, Result, TrainerError};

/// Aligned inputs of one training step.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    /// Conditioning mel segment `[batch, n_mels, segment_frames]`, detached.
    pub mel: Array,
    /// Target waveform segment `[batch, 1, segment_size]`.
    pub target: Array,
    /// Frame mask `[batch, segment_frames]`.
    pub mask: Array,
    /// Start frame per example.
    pub offsets: Vec<i32>,
    /// Unpadded frames per example.
    pub valid_frames: Vec<i32>,
}

/// Evaluated discriminator-phase losses.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscriminatorStepOutput {
    pub loss: f64,
    pub period_real: Vec<f64>,
    pub period_generated: Vec<f64>,
    pub scale_real: Vec<f64>,
    pub scale_generated: Vec<f64>,
}

/// Evaluated generator-phase losses.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorStepOutput {
    pub loss: f64,
    pub period_adversarial: f64,
    pub scale_adversarial: f64,
    pub period_feature_matching: f64,
    pub scale_feature_matching: f64,
    /// Mel reconstruction term, already scaled by `c_mel`.
    pub mel: f64,
    pub period_terms: Vec<f64>,
    pub scale_terms: Vec<f64>,
    /// Examples that contributed to the mel term.
    pub valid_examples: usize,
}

/// Outcome of a completed training step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Global step the losses were logged at.
    pub step: usize,
    pub discriminator: DiscriminatorStepOutput,
    pub generator: GeneratorStepOutput,
}

struct GeneratorTerms {
    period: AdversarialLossOutput,
    scale: AdversarialLossOutput,
    period_fm: Array,
    scale_fm: Array,
    mel: Array,
    valid_examples: Array,
}

/// Two-player trainer owning both models, their optimizers and schedules.
pub struct GanTrainer {
    config: HifiGanConfig,
    generator: Generator,
    discriminators: DiscriminatorEnsemble,
    optim_g: AdamW,
    optim_d: AdamW,
    sched_g: ExponentialLr,
    sched_d: ExponentialLr,
    pipeline: FeaturePipeline,
    sampler: SegmentSampler,
    validator: Validator,
    sink: Box<dyn MetricSink>,
    reducer: Box<dyn MetricReducer>,
    checkpoints: Option<CheckpointManager>,
    segment_frames: i32,
    global_step: usize,
    next_epoch: usize,
    best_val_loss: Option<f64>,
}

impl GanTrainer {
    /// Validate the configuration and build fresh models and optimizers.
    pub fn new(config: &HifiGanConfig) -> Result<Self> {
        config.validate()?;
        let train = &config.train;

        let generator = Generator::for_hop(&config.model.generator, config.data.hop_length)?;
        let discriminators = DiscriminatorEnsemble::new(&config.model.discriminator)?;

        let optim_g = build_adamw(config, train.generator_learning_rate)?;
        let optim_d = build_adamw(config, train.discriminator_learning_rate)?;

        let pipeline = FeaturePipeline::new(&config.data, &config.augment, train.seed)?;
        let sampler = SegmentSampler::new(train.seed.wrapping_add(1));
        let validator = Validator::new(train.max_valid_examples, config.data.sampling_rate as u32);

        tracing::info!(
            generator_params = generator.num_parameters(),
            discriminator_params = count_parameters(&discriminators),
            segment_size = train.segment_size,
            "Built adversarial trainer"
        );

        Ok(Self {
            config: config.clone(),
            generator,
            discriminators,
            optim_g,
            optim_d,
            sched_g: ExponentialLr::new(train.generator_learning_rate as f64, train.lr_decay),
            sched_d: ExponentialLr::new(train.discriminator_learning_rate as f64, train.lr_decay),
            pipeline,
            sampler,
            validator,
            sink: Box::new(TracingSink::new(train.log_interval)),
            reducer: Box::new(LocalReducer),
            checkpoints: None,
            segment_frames: config.segment_frames()?,
            global_step: 0,
            next_epoch: 0,
            best_val_loss: None,
        })
    }

    /// Replace the metric sink.
    pub fn with_sink(mut self, sink: impl MetricSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Replace the cross-process reducer used for epoch metrics.
    pub fn with_reducer(mut self, reducer: impl MetricReducer + 'static) -> Self {
        self.reducer = Box::new(reducer);
        self
    }

    /// Save a checkpoint at the end of every epoch.
    pub fn with_checkpoint_manager(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    pub fn config(&self) -> &HifiGanConfig {
        &self.config
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn discriminators(&self) -> &DiscriminatorEnsemble {
        &self.discriminators
    }

    pub fn pipeline(&self) -> &FeaturePipeline {
        &self.pipeline
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Epoch the next call to [`start_epoch`](Self::start_epoch) begins.
    pub fn next_epoch(&self) -> usize {
        self.next_epoch
    }

    pub fn best_val_loss(&self) -> Option<f64> {
        self.best_val_loss
    }

    /// Current generator and discriminator learning rates.
    pub fn learning_rates(&self) -> (f64, f64) {
        (self.sched_g.current_lr(), self.sched_d.current_lr())
    }

    /// Step both schedules into the next epoch and push the rates into the
    /// optimizers. Returns the epoch index.
    pub fn start_epoch(&mut self) -> usize {
        let lr_g = self.sched_g.step();
        let lr_d = self.sched_d.step();
        self.optim_g.lr = array!(lr_g as f32);
        self.optim_d.lr = array!(lr_d as f32);

        let epoch = self.sched_g.last_epoch().max(0) as usize;
        tracing::debug!(epoch, lr_g, lr_d, "Epoch start");
        epoch
    }

    /// Run one adversarial step.
    ///
    /// # Errors
    /// [`TrainerError::StepAborted`] if either phase fails before its update.
    /// A discriminator-phase abort leaves both models untouched.
    pub fn train_step(&mut self, batch: &AudioBatch) -> Result<StepOutcome> {
        let prepared = self
            .prepare_step(batch)
            .map_err(|e| abort(Phase::Discriminator, e))?;
        let discriminator = self
            .discriminator_phase(&prepared)
            .map_err(|e| abort(Phase::Discriminator, e))?;
        let generator = self
            .generator_phase(&prepared)
            .map_err(|e| abort(Phase::Generator, e))?;

        let outcome = StepOutcome {
            step: self.global_step,
            discriminator,
            generator,
        };
        self.log_step(&outcome);
        self.global_step += 1;
        Ok(outcome)
    }

    /// Extract conditioning features, draw segments and cut the aligned
    /// target waveform.
    pub fn prepare_step(&mut self, batch: &AudioBatch) -> Result<PreparedStep> {
        let hop = self.pipeline.hop_length();
        let mel = self
            .pipeline
            .conditioning_mel(&batch.conditioning_waveform, true)?;
        let mel_lengths = batch.mel_lengths(hop);

        let sample = self
            .sampler
            .sample(&mel, &mel_lengths, self.segment_frames)?;
        let target = slice_segments(
            &batch.target_waveform,
            &sample.sample_offsets(hop),
            self.config.train.segment_size,
        )?;
        let mask = sequence_mask(&sample.valid_frames, self.segment_frames);

        Ok(PreparedStep {
            mel: sample.mel,
            target,
            mask,
            offsets: sample.offsets,
            valid_frames: sample.valid_frames,
        })
    }

    /// Discriminator update against a detached generator output.
    ///
    /// The loss and every logged term are evaluated, and the loss checked
    /// finite, before the optimizer runs.
    pub fn discriminator_phase(&mut self, step: &PreparedStep) -> Result<DiscriminatorStepOutput> {
        let (loss, grads, (period, scale)) = self.discriminator_loss_and_grads(step)?;

        let loss = scalar(&loss)?;
        if !loss.is_finite() {
            return Err(TrainerError::StepAborted {
                phase: Phase::Discriminator,
                reason: format!("non-finite discriminator loss {}", loss),
            });
        }
        let output = DiscriminatorStepOutput {
            loss,
            period_real: scalars(&period.real_terms)?,
            period_generated: scalars(&period.generated_terms)?,
            scale_real: scalars(&scale.real_terms)?,
            scale_generated: scalars(&scale.generated_terms)?,
        };

        self.optim_d.update(&mut self.discriminators, grads)?;
        eval_params(self.discriminators.parameters())?;
        Ok(output)
    }

    /// Generator update scored by the current discriminators.
    ///
    /// Frames past each example's valid length are excluded from the mel term.
    pub fn generator_phase(&mut self, step: &PreparedStep) -> Result<GeneratorStepOutput> {
        let (loss, grads, terms) = self.generator_loss_and_grads(step)?;

        let loss = scalar(&loss)?;
        if !loss.is_finite() {
            return Err(TrainerError::StepAborted {
                phase: Phase::Generator,
                reason: format!("non-finite generator loss {}", loss),
            });
        }
        let output = GeneratorStepOutput {
            loss,
            period_adversarial: scalar(&terms.period.total)?,
            scale_adversarial: scalar(&terms.scale.total)?,
            period_feature_matching: scalar(&terms.period_fm)?,
            scale_feature_matching: scalar(&terms.scale_fm)?,
            mel: scalar(&terms.mel)?,
            period_terms: scalars(&terms.period.terms)?,
            scale_terms: scalars(&terms.scale.terms)?,
            valid_examples: scalar(&terms.valid_examples)? as usize,
        };

        self.optim_g.update(&mut self.generator, grads)?;
        eval_params(self.generator.parameters())?;
        Ok(output)
    }

    /// Discriminator-loss gradients for a prepared step, without updating.
    ///
    /// Keys are the discriminator ensemble's own parameter names.
    pub fn discriminator_gradients(&mut self, step: &PreparedStep) -> Result<FlattenedModuleParam> {
        Ok(self.discriminator_loss_and_grads(step)?.1)
    }

    /// Generator-loss gradients for a prepared step, without updating.
    ///
    /// Keys are the generator's own parameter names.
    pub fn generator_gradients(&mut self, step: &PreparedStep) -> Result<FlattenedModuleParam> {
        Ok(self.generator_loss_and_grads(step)?.1)
    }

    fn discriminator_loss_and_grads(
        &mut self,
        step: &PreparedStep,
    ) -> Result<(
        Array,
        FlattenedModuleParam,
        (DiscriminatorLossOutput, DiscriminatorLossOutput),
    )> {
        let y_hat = mlx_rs::stop_gradient(&self.generator.forward(&step.mel)?)?;

        let terms: RefCell<Option<(DiscriminatorLossOutput, DiscriminatorLossOutput)>> =
            RefCell::new(None);
        let loss_fn = |discriminators: &mut DiscriminatorEnsemble,
                       (y, y_hat): (&Array, &Array)|
         -> std::result::Result<Array, Exception> {
            let (period, scale) = discriminators.score(y, y_hat)?;
            let period = discriminator_loss(&period.real_scores, &period.generated_scores)?;
            let scale = discriminator_loss(&scale.real_scores, &scale.generated_scores)?;
            let total = period.total.add(&scale.total)?;
            *terms.borrow_mut() = Some((period, scale));
            Ok(total)
        };

        let mut loss_and_grad_fn = nn::value_and_grad(loss_fn);
        let (loss, grads) = loss_and_grad_fn(&mut self.discriminators, (&step.target, &y_hat))?;

        let terms = terms.take().ok_or_else(|| {
            TrainerError::Config("discriminator loss terms were not recorded".into())
        })?;
        Ok((loss, grads, terms))
    }

    fn generator_loss_and_grads(
        &mut self,
        step: &PreparedStep,
    ) -> Result<(Array, FlattenedModuleParam, GeneratorTerms)> {
        let y_mel = mlx_rs::stop_gradient(&self.pipeline.mel(&step.target)?)?;

        let discriminators = &self.discriminators;
        let pipeline = &self.pipeline;
        let c_mel = Array::from_f32(self.config.train.c_mel);

        let terms: RefCell<Option<GeneratorTerms>> = RefCell::new(None);
        let loss_fn = |generator: &mut Generator,
                       (mel, y, y_mel, mask): (&Array, &Array, &Array, &Array)|
         -> std::result::Result<Array, Exception> {
            let y_hat = generator.forward(mel)?;
            let (period, scale) = discriminators.score(y, &y_hat)?;

            let period_adv = generator_adversarial_loss(&period.generated_scores)?;
            let scale_adv = generator_adversarial_loss(&scale.generated_scores)?;
            let period_fm =
                feature_matching_loss(&period.real_feature_maps, &period.generated_feature_maps)?;
            let scale_fm =
                feature_matching_loss(&scale.real_feature_maps, &scale.generated_feature_maps)?;

            let y_hat_mel = pipeline.mel(&y_hat)?;
            let masked = masked_mel_l1_loss(y_mel, &y_hat_mel, mask)?;
            let mel_term = masked.loss.multiply(&c_mel)?;

            let total = scale_adv
                .total
                .add(&scale_fm)?
                .add(&period_adv.total.add(&period_fm)?)?
                .add(&mel_term)?;

            *terms.borrow_mut() = Some(GeneratorTerms {
                period: period_adv,
                scale: scale_adv,
                period_fm,
                scale_fm,
                mel: mel_term,
                valid_examples: masked.valid_examples,
            });
            Ok(total)
        };

        let mut loss_and_grad_fn = nn::value_and_grad(loss_fn);
        let (loss, grads) = loss_and_grad_fn(
            &mut self.generator,
            (&step.mel, &step.target, &y_mel, &step.mask),
        )?;

        let terms = terms
            .take()
            .ok_or_else(|| TrainerError::Config("generator loss terms were not recorded".into()))?;
        Ok((loss, grads, terms))
    }

    fn log_step(&mut self, outcome: &StepOutcome) {
        let step = outcome.step;
        let sink = &mut self.sink;
        let d = &outcome.discriminator;
        let g = &outcome.generator;

        sink.record_scalar("train/d/loss_total", d.loss, step);
        for (family, values) in [
            ("d_p_r", &d.period_real),
            ("d_p_g", &d.period_generated),
            ("d_s_r", &d.scale_real),
            ("d_s_g", &d.scale_generated),
        ] {
            for (i, v) in values.iter().enumerate() {
                sink.record_scalar(&format!("train/{}/{}", family, i), *v, step);
            }
        }

        sink.record_scalar("train/g/loss_total", g.loss, step);
        sink.record_scalar("train/g/p_fm", g.period_feature_matching, step);
        sink.record_scalar("train/g/s_fm", g.scale_feature_matching, step);
        sink.record_scalar("train/g/p_gen", g.period_adversarial, step);
        sink.record_scalar("train/g/s_gen", g.scale_adversarial, step);
        sink.record_scalar("train/g/loss_mel", g.mel, step);
        for (i, v) in g.period_terms.iter().enumerate() {
            sink.record_scalar(&format!("train/g/p_gen_{}", i), *v, step);
        }
        for (i, v) in g.scale_terms.iter().enumerate() {
            sink.record_scalar(&format!("train/g/s_gen_{}", i), *v, step);
        }

        sink.record_scalar("learning_rate", self.sched_g.current_lr(), step);
    }

    /// Score one validation batch with the current generator.
    pub fn validation_step(&mut self, batch: &AudioBatch) -> Result<ValidationStepOutput> {
        self.validator.validation_step(
            &self.generator,
            &self.pipeline,
            batch,
            self.sink.as_mut(),
            self.global_step,
        )
    }

    /// Reduce and log the epoch validation loss, then reset the accumulator.
    pub fn validation_epoch_end(&mut self) -> Result<Option<f64>> {
        self.validator.validation_epoch_end(
            self.reducer.as_ref(),
            self.sink.as_mut(),
            self.global_step,
        )
    }

    /// Train until `config.train.epochs`, validating and checkpointing after
    /// every epoch.
    ///
    /// Aborted steps are logged and skipped. Returns one summary per epoch run.
    pub fn fit(
        &mut self,
        train_batches: &[AudioBatch],
        valid_batches: &[AudioBatch],
    ) -> Result<Vec<EpochMetrics>> {
        let mut history = Vec::new();

        while self.next_epoch < self.config.train.epochs {
            let epoch = self.start_epoch();
            let mut d_sum = 0.0;
            let mut g_sum = 0.0;
            let mut completed = 0usize;
            let mut aborted = 0usize;

            for batch in train_batches {
                match self.train_step(batch) {
                    Ok(outcome) => {
                        d_sum += outcome.discriminator.loss;
                        g_sum += outcome.generator.loss;
                        completed += 1;
                    }
                    Err(TrainerError::StepAborted { phase, reason }) => {
                        tracing::warn!(epoch, %phase, reason = %reason, "Skipping aborted step");
                        aborted += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            for batch in valid_batches {
                self.validation_step(batch)?;
            }
            let validation_mel_loss = self.validation_epoch_end()?;

            let mean = |sum: f64| if completed > 0 { sum / completed as f64 } else { 0.0 };
            let metrics = EpochMetrics {
                epoch,
                global_step: self.global_step,
                discriminator_loss: mean(d_sum),
                generator_loss: mean(g_sum),
                validation_mel_loss,
                aborted_steps: aborted,
            };
            if let Err(e) = self.sink.on_epoch_end(&metrics) {
                tracing::warn!(error = %e, "Metric sink rejected epoch summary");
            }
            if let Err(e) = self.sink.flush() {
                tracing::warn!(error = %e, "Metric sink flush failed");
            }

            let is_best = match (validation_mel_loss, self.best_val_loss) {
                (Some(v), Some(best)) => v < best,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if is_best {
                self.best_val_loss = validation_mel_loss;
            }

            self.next_epoch = epoch + 1;
            if self.checkpoints.is_some() {
                let state = self.checkpoint_state()?;
                if let Some(manager) = &self.checkpoints {
                    manager.save_checkpoint(&state, is_best)?;
                }
            }

            history.push(metrics);
        }

        Ok(history)
    }

    /// Prefixed parameters of both models.
    pub fn model_state(&self) -> HashMap<Rc<str>, Array> {
        let mut state = prefixed_parameters(&self.generator, GENERATOR_PREFIX);
        state.extend(prefixed_parameters(&self.discriminators, DISCRIMINATOR_PREFIX));
        state
    }

    /// Everything needed to resume at [`next_epoch`](Self::next_epoch).
    pub fn checkpoint_state(&self) -> Result<CheckpointState> {
        let (lr_g, lr_d) = self.learning_rates();
        let mut metadata = CheckpointMetadata::new(self.next_epoch, self.global_step, lr_g, lr_d)
            .with_seed(self.config.train.seed)
            .with_config(self.config.to_json()?);
        if let Some(best) = self.best_val_loss {
            metadata = metadata.with_best_val_loss(best);
        }

        Ok(CheckpointState {
            params: self.model_state(),
            optimizer_g: Some(optimizer_state(&self.optim_g)),
            optimizer_d: Some(optimizer_state(&self.optim_d)),
            metadata,
        })
    }

    /// Reconcile a loaded checkpoint against the current models and resume.
    pub fn resume_from_checkpoint(&mut self, checkpoint: CheckpointState) -> Result<ReconcileReport> {
        let resume = ResumeState::from_checkpoint(checkpoint, &self.model_state());
        let report = resume.report.clone();
        self.resume(resume)?;
        Ok(report)
    }

    /// Apply reconciled state and position both schedules at its epoch.
    pub fn resume(&mut self, state: ResumeState) -> Result<()> {
        let applied_g = apply_parameters(&mut self.generator, GENERATOR_PREFIX, &state.params);
        let applied_d =
            apply_parameters(&mut self.discriminators, DISCRIMINATOR_PREFIX, &state.params);
        eval_params(self.generator.parameters())?;
        eval_params(self.discriminators.parameters())?;

        match (&state.optimizer_g, &state.optimizer_d) {
            (Some(g), Some(d)) => {
                restore_optimizer_state(&mut self.optim_g, g);
                restore_optimizer_state(&mut self.optim_d, d);
            }
            _ => {
                self.optim_g.state.clear();
                self.optim_d.state.clear();
            }
        }

        let train = &self.config.train;
        self.sched_g =
            ExponentialLr::resume(train.generator_learning_rate as f64, train.lr_decay, state.epoch);
        self.sched_d = ExponentialLr::resume(
            train.discriminator_learning_rate as f64,
            train.lr_decay,
            state.epoch,
        );
        self.next_epoch = state.epoch;
        self.global_step = state.step;
        self.best_val_loss = state.best_val_loss;

        tracing::info!(
            epoch = state.epoch,
            step = state.step,
            generator_params = applied_g,
            discriminator_params = applied_d,
            optimizer_restored = state.optimizer_g.is_some(),
            changed = state.changed,
            "Resumed training"
        );
        Ok(())
    }
}

fn build_adamw(config: &HifiGanConfig, lr: f32) -> Result<AdamW> {
    let train = &config.train;
    AdamWBuilder::new(lr)
        .betas(train.betas)
        .eps(train.eps)
        .weight_decay(train.weight_decay)
        .build()
        .map_err(|_| TrainerError::Config("Failed to build AdamW optimizer".into()))
}

fn count_parameters<M: ModuleParameters>(module: &M) -> usize {
    module.parameters().flatten().values().map(|p| p.size()).sum()
}

/// Wrap a phase failure, keeping an existing abort as is.
fn abort(phase: Phase, err: TrainerError) -> TrainerError {
    match err {
        e @ TrainerError::StepAborted { .. } => e,
        other => TrainerError::StepAborted {
            phase,
            reason: other.to_string(),
        },
    }
}

fn scalar(a: &Array) -> Result<f64> {
    a.eval()?;
    Ok(a.item::<f32>() as f64)
}

fn scalars(arrays: &[Array]) -> Result<Vec<f64>> {
    arrays.iter().map(scalar).collect()
}
