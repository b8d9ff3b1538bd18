//! End-to-end tests of the adversarial trainer on tiny models.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use hifimetal_core::{AugmentConfig, DataConfig};
use hifimetal_trainer::callbacks::{RecordingSink, SharedSink};
use hifimetal_trainer::{
    slice_segments, AudioBatch, CheckpointManager, GanTrainer, HifiGanConfig, Phase,
    SegmentSampler, TrainerError,
};
use hifimetal_vocoder::FeaturePipeline;
use mlx_rs::{module::ModuleParameters, ops::indexing::IndexOp, Array};
use tempfile::TempDir;

fn noise(batch: i32, samples: i32) -> Array {
    mlx_rs::random::uniform::<_, f32>(-0.5, 0.5, &[batch, 1, samples], None).unwrap()
}

fn max_abs_diff(a: &Array, b: &Array) -> f32 {
    let d = a.subtract(b).unwrap().abs().unwrap().max(None).unwrap();
    d.eval().unwrap();
    d.item::<f32>()
}

/// Largest element-wise change over the keys starting with `prefix`.
fn max_change(before: &HashMap<Rc<str>, Array>, after: &HashMap<Rc<str>, Array>, prefix: &str) -> f32 {
    before
        .iter()
        .filter(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| max_abs_diff(v, &after[k]))
        .fold(0.0, f32::max)
}

#[test]
fn test_segment_alignment_exact_when_window_equals_hop() {
    let mut config = HifiGanConfig::tiny();
    config.data.filter_length = 64;
    config.data.win_length = 64;
    let pipeline = FeaturePipeline::new(&config.data, &config.augment, 0).unwrap();
    let hop = config.data.hop_length;

    let wav = noise(2, 2048);
    let mel = pipeline.mel(&wav).unwrap();
    assert_eq!(mel.dim(2), 32);

    let mut sampler = SegmentSampler::new(5);
    let sample = sampler.sample(&mel, &[32, 20], 8).unwrap();
    let wav_seg = slice_segments(&wav, &sample.sample_offsets(hop), 8 * hop).unwrap();
    assert_eq!(wav_seg.dim(2), 8 * hop);

    let recomputed = pipeline.mel(&wav_seg).unwrap();
    assert_eq!(recomputed.shape(), sample.mel.shape());
    assert!(max_abs_diff(&recomputed, &sample.mel) < 1e-4);
}

#[test]
fn test_segment_alignment_interior_frames() {
    let config = HifiGanConfig::tiny();
    let pipeline = FeaturePipeline::new(&config.data, &config.augment, 0).unwrap();
    let hop = config.data.hop_length;

    let wav = noise(2, 2048);
    let mel = pipeline.mel(&wav).unwrap();

    let mut sampler = SegmentSampler::new(11);
    let sample = sampler.sample(&mel, &[32, 32], 8).unwrap();
    let wav_seg = slice_segments(&wav, &sample.sample_offsets(hop), 8 * hop).unwrap();
    let recomputed = pipeline.mel(&wav_seg).unwrap();

    // windows of frames 2..6 lie entirely inside the 512-sample slice
    let interior = recomputed.index((.., .., 2..6));
    let expected = sample.mel.index((.., .., 2..6));
    assert!(max_abs_diff(&interior, &expected) < 1e-3);
}

#[test]
fn test_offsets_in_range_48khz() {
    let data = DataConfig::default();
    let hop = data.hop_length;
    let frames = data.segment_frames(8192).unwrap();
    assert_eq!(frames, 16);

    let pipeline = FeaturePipeline::new(&data, &AugmentConfig::identity(), 0).unwrap();
    let wav = noise(2, 48000);
    let mel = pipeline.mel(&wav).unwrap();
    mel.eval().unwrap();
    let lengths = [data.frames_for(48000), data.frames_for(12000)];
    assert!(mel.dim(2) >= lengths[0]);

    let mut sampler = SegmentSampler::new(1234);
    for _ in 0..1000 {
        let sample = sampler.sample(&mel, &lengths, frames).unwrap();
        assert_eq!(sample.mel.shape(), &[2, data.n_mel_channels, frames]);
        assert!(sample.offsets[0] >= 0 && sample.offsets[0] <= lengths[0] - frames);
        assert!(sample.offsets[1] >= 0 && sample.offsets[1] <= lengths[1] - frames);
        assert_eq!(sample.valid_frames, vec![frames, frames]);

        let wav_seg = slice_segments(&wav, &sample.sample_offsets(hop), 8192).unwrap();
        assert_eq!(wav_seg.shape(), &[2, 1, 8192]);
    }
}

#[test]
fn test_phases_only_touch_their_own_module() {
    let config = HifiGanConfig::tiny();
    let mut trainer = GanTrainer::new(&config).unwrap();
    trainer.start_epoch();

    let batch = AudioBatch::paired(noise(2, 1024), vec![1024, 1024]).unwrap();
    let prepared = trainer.prepare_step(&batch).unwrap();

    let before = trainer.model_state();
    trainer.discriminator_phase(&prepared).unwrap();
    let after_d = trainer.model_state();
    assert_eq!(max_change(&before, &after_d, "generator."), 0.0);
    assert!(max_change(&before, &after_d, "discriminator.") > 0.0);

    trainer.generator_phase(&prepared).unwrap();
    let after_g = trainer.model_state();
    assert_eq!(max_change(&after_d, &after_g, "discriminator."), 0.0);
    assert!(max_change(&after_d, &after_g, "generator.") > 0.0);
}

#[test]
fn test_phase_gradients_cover_only_the_owning_module() {
    let config = HifiGanConfig::tiny();
    let mut trainer = GanTrainer::new(&config).unwrap();
    trainer.start_epoch();

    let batch = AudioBatch::paired(noise(2, 1024), vec![1024, 1024]).unwrap();
    let prepared = trainer.prepare_step(&batch).unwrap();
    let before = trainer.model_state();

    let generator_keys: HashSet<Rc<str>> = trainer
        .generator()
        .trainable_parameters()
        .flatten()
        .into_keys()
        .collect();
    let discriminator_keys: HashSet<Rc<str>> = trainer
        .discriminators()
        .trainable_parameters()
        .flatten()
        .into_keys()
        .collect();

    let d_grads = trainer.discriminator_gradients(&prepared).unwrap();
    let d_grad_keys: HashSet<Rc<str>> = d_grads.keys().cloned().collect();
    assert_eq!(d_grad_keys, discriminator_keys);
    assert!(d_grad_keys.contains("period.discriminators.0.conv_post.weight_v"));
    assert!(!d_grad_keys.contains("conv_pre.weight_v"));

    let g_grads = trainer.generator_gradients(&prepared).unwrap();
    let g_grad_keys: HashSet<Rc<str>> = g_grads.keys().cloned().collect();
    assert_eq!(g_grad_keys, generator_keys);
    assert!(g_grad_keys.contains("conv_pre.weight_v"));
    assert!(!g_grad_keys.contains("period.discriminators.0.conv_post.weight_v"));

    // computing gradients alone applies no update
    let after = trainer.model_state();
    assert_eq!(max_change(&before, &after, ""), 0.0);
}

#[test]
fn test_losses_are_non_negative() {
    let config = HifiGanConfig::tiny();
    let mut trainer = GanTrainer::new(&config).unwrap();
    trainer.start_epoch();

    let batch = AudioBatch::paired(noise(2, 1024), vec![1024, 300]).unwrap();
    let outcome = trainer.train_step(&batch).unwrap();

    let d = &outcome.discriminator;
    let g = &outcome.generator;
    assert!(d.loss >= 0.0);
    for v in d
        .period_real
        .iter()
        .chain(&d.period_generated)
        .chain(&d.scale_real)
        .chain(&d.scale_generated)
    {
        assert!(*v >= 0.0);
    }
    for v in [
        g.loss,
        g.period_adversarial,
        g.scale_adversarial,
        g.period_feature_matching,
        g.scale_feature_matching,
        g.mel,
    ] {
        assert!(v >= 0.0);
    }
}

#[test]
fn test_short_example_is_padded_and_masked() {
    let config = HifiGanConfig::tiny();
    let mut trainer = GanTrainer::new(&config).unwrap();

    // second example has 3 valid frames of the 8-frame segment
    let batch = AudioBatch::paired(noise(2, 1024), vec![1024, 200]).unwrap();
    let prepared = trainer.prepare_step(&batch).unwrap();
    assert_eq!(prepared.offsets[1], 0);
    assert_eq!(prepared.valid_frames, vec![8, 3]);

    prepared.mask.eval().unwrap();
    let mask = prepared.mask.reshape(&[-1]).unwrap();
    mask.eval().unwrap();
    let row = &mask.as_slice::<f32>()[8..];
    assert_eq!(row, &[1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_non_finite_discriminator_loss_aborts_step() {
    let config = HifiGanConfig::tiny();
    let mut trainer = GanTrainer::new(&config).unwrap();
    trainer.start_epoch();
    let before = trainer.model_state();

    let conditioning = noise(1, 1024);
    let target = Array::from_slice(&vec![f32::NAN; 1024], &[1, 1, 1024]);
    let batch = AudioBatch::new(conditioning, vec![1024], target, vec![1024]).unwrap();

    let err = trainer.train_step(&batch).unwrap_err();
    assert!(matches!(
        err,
        TrainerError::StepAborted {
            phase: Phase::Discriminator,
            ..
        }
    ));
    assert_eq!(trainer.global_step(), 0);

    let after = trainer.model_state();
    assert_eq!(max_change(&before, &after, "generator."), 0.0);
    assert_eq!(max_change(&before, &after, "discriminator."), 0.0);
}

#[test]
fn test_validation_loss_zero_when_generation_matches_target() {
    let config = HifiGanConfig::tiny();
    let recorder = SharedSink::new(RecordingSink::new());
    let mut trainer = GanTrainer::new(&config).unwrap().with_sink(recorder.clone());

    let conditioning = noise(1, 1024);
    let mel = trainer.pipeline().mel(&conditioning).unwrap();
    let generated = trainer.generator().forward(&mel).unwrap();

    // keep the generated audio where the mask is on, scramble the rest
    let kept = generated.index((.., .., ..640));
    let scrambled = noise(1, 384);
    let target = mlx_rs::ops::concatenate_axis(&[&kept, &scrambled], 2).unwrap();

    let batch = AudioBatch::new(conditioning, vec![512], target, vec![1024]).unwrap();
    let out = trainer.validation_step(&batch).unwrap();

    assert_eq!(out.valid_examples, 1);
    assert!(out.loss.abs() < 1e-5, "loss {}", out.loss);
    let epoch = trainer.validation_epoch_end().unwrap().unwrap();
    assert!(epoch.abs() < 1e-5);
    assert!(recorder.0.borrow().has_tag("valid/loss_mel_epoch"));
}

#[test]
fn test_fit_skips_aborted_steps_and_checkpoints() {
    let temp_dir = TempDir::new().unwrap();
    let config = HifiGanConfig::tiny();
    let manager = CheckpointManager::new(temp_dir.path()).unwrap();
    let mut trainer = GanTrainer::new(&config)
        .unwrap()
        .with_checkpoint_manager(manager);

    let train = vec![
        AudioBatch::paired(noise(2, 1024), vec![1024, 900]).unwrap(),
        // fewer physical frames than one segment
        AudioBatch::paired(noise(1, 384), vec![384]).unwrap(),
    ];
    let valid = vec![AudioBatch::paired(noise(1, 1024), vec![1024]).unwrap()];

    let history = trainer.fit(&train, &valid).unwrap();
    assert_eq!(history.len(), 2);
    for (epoch, metrics) in history.iter().enumerate() {
        assert_eq!(metrics.epoch, epoch);
        assert_eq!(metrics.aborted_steps, 1);
        assert!(metrics.validation_mel_loss.is_some());
    }
    assert_eq!(trainer.global_step(), 2);
    assert_eq!(trainer.next_epoch(), 2);

    let reader = CheckpointManager::new(temp_dir.path()).unwrap();
    let epochs: Vec<usize> = reader
        .list_checkpoints()
        .unwrap()
        .iter()
        .map(|(e, _)| *e)
        .collect();
    assert_eq!(epochs, vec![1, 2]);

    let latest = reader.load_latest().unwrap().unwrap();
    assert_eq!(latest.metadata.epoch, 2);
    assert_eq!(latest.metadata.step, 2);
    assert!(latest.optimizer_g.is_some());
    assert!(reader.load_best().unwrap().is_some());
}

#[test]
fn test_resume_restores_progress_and_schedule() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = HifiGanConfig::tiny();
    config.train.lr_decay = 0.5;
    config.train.epochs = 3;

    let mut trainer = GanTrainer::new(&config).unwrap();
    trainer.start_epoch();
    trainer.start_epoch();
    let batch = AudioBatch::paired(noise(1, 1024), vec![1024]).unwrap();
    trainer.train_step(&batch).unwrap();

    let manager = CheckpointManager::new(temp_dir.path()).unwrap();
    let mut state = trainer.checkpoint_state().unwrap();
    state.metadata.epoch = 2;
    let path = manager.save_checkpoint(&state, false).unwrap();

    let loaded = CheckpointManager::load_checkpoint(&path).unwrap();
    let mut resumed = GanTrainer::new(&config).unwrap();
    let report = resumed.resume_from_checkpoint(loaded).unwrap();

    assert!(report.is_clean());
    assert_eq!(resumed.next_epoch(), 2);
    assert_eq!(resumed.global_step(), 1);
    let before = trainer.model_state();
    let after = resumed.model_state();
    assert_eq!(max_change(&before, &after, ""), 0.0);

    let restored = resumed.checkpoint_state().unwrap();
    assert!(!restored.optimizer_g.unwrap().is_empty());

    // first epoch after resume lands on base * gamma^2
    assert_eq!(resumed.start_epoch(), 2);
    let (lr_g, lr_d) = resumed.learning_rates();
    assert!((lr_g - 2e-4 * 0.25).abs() < 1e-10);
    assert!((lr_d - 2e-4 * 0.25).abs() < 1e-10);
}

#[test]
fn test_resume_after_architecture_change_drops_optimizer_state() {
    let temp_dir = TempDir::new().unwrap();
    let config = HifiGanConfig::tiny();

    let mut trainer = GanTrainer::new(&config).unwrap();
    trainer.start_epoch();
    let batch = AudioBatch::paired(noise(1, 1024), vec![1024]).unwrap();
    trainer.train_step(&batch).unwrap();

    let mut state = trainer.checkpoint_state().unwrap();
    let key: Rc<str> = Rc::from("generator.conv_pre.weight_v");
    let current_shape = state.params[&key].shape().to_vec();
    let mut stale_shape = current_shape.clone();
    stale_shape[1] += 3;
    state.params.insert(
        key.clone(),
        mlx_rs::ops::zeros::<f32>(&stale_shape).unwrap(),
    );
    state.params.insert(
        Rc::from("generator.legacy_proj.weight"),
        mlx_rs::ops::zeros::<f32>(&[128, 256]).unwrap(),
    );

    let manager = CheckpointManager::new(temp_dir.path()).unwrap();
    let path = manager.save_checkpoint(&state, false).unwrap();
    let loaded = CheckpointManager::load_checkpoint(&path).unwrap();
    assert!(loaded.optimizer_g.is_some());

    let mut resumed = GanTrainer::new(&config).unwrap();
    let fresh = resumed.model_state()[&key].clone();
    let report = resumed.resume_from_checkpoint(loaded).unwrap();

    assert_eq!(report.dropped, vec!["generator.legacy_proj.weight".to_string()]);
    assert_eq!(report.shape_mismatched.len(), 1);
    assert_eq!(report.shape_mismatched[0].current, current_shape);
    assert_eq!(report.shape_mismatched[0].loaded, stale_shape);

    let after = resumed.model_state();
    assert_eq!(after[&key].shape(), current_shape.as_slice());
    assert_eq!(max_abs_diff(&after[&key], &fresh), 0.0);
    assert!(resumed.checkpoint_state().unwrap().optimizer_g.unwrap().is_empty());
    assert_eq!(resumed.next_epoch(), state.metadata.epoch);

    // the patched model still trains
    resumed.start_epoch();
    resumed.train_step(&batch).unwrap();
}
