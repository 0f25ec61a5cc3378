//! Engine tests against a probe model with scripted gradients

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use approx::assert_abs_diff_eq;
use ndarray::{arr1, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::autograd::Tensor;
use crate::checkpoint::{Checkpointer, DirCheckpointer};
use crate::data::{
    min_input_length, Collator, DownsamplingStack, MaskGenerator, MaskedBatch, Sample,
};
use crate::distributed::{GradientSync, ThreadGroup};
use crate::error::{Error, Result};
use crate::model::{InfoNce, ReferenceModel, ReferenceModelConfig};
use crate::optim::{LrSchedule, TemperatureSchedule, SGD};
use crate::tracking::InMemoryTracker;
use crate::train::forward::gather_masked;
use crate::train::stages::{
    BackwardSignal, EncoderOutput, PretrainModel, QuantizerOutput, QuantizerStats,
};

const DIVERSITY_LOSS: f32 = 0.25;

#[derive(Debug, Default)]
struct ProbeLog {
    temperatures: Vec<f32>,
    diversity_coeffs: Vec<f32>,
}

/// One scalar weight; every backward adds `signal.scale` to its gradient
struct ProbeModel {
    params: Vec<Tensor>,
    quantizer: bool,
    diversity_loss: f32,
    temperature: f32,
    poison: Arc<AtomicBool>,
    log: Arc<Mutex<ProbeLog>>,
}

impl ProbeModel {
    fn new() -> Self {
        Self {
            params: vec![Tensor::new("w", arr1(&[1.0]))],
            quantizer: false,
            diversity_loss: DIVERSITY_LOSS,
            temperature: 0.0,
            poison: Arc::new(AtomicBool::new(false)),
            log: Arc::new(Mutex::new(ProbeLog::default())),
        }
    }

    fn with_quantizer(mut self) -> Self {
        self.quantizer = true;
        self
    }

    fn with_diversity_loss(mut self, diversity_loss: f32) -> Self {
        self.diversity_loss = diversity_loss;
        self
    }
}

impl PretrainModel for ProbeModel {
    fn latent_extractor(&self, wavs: ArrayView2<'_, f32>) -> Result<Array3<f32>> {
        let (b, t) = wavs.dim();
        Ok(Array3::from_shape_fn((b, t, 2), |(i, j, c)| match c {
            0 => wavs[[i, j]] + 1.0,
            _ => j as f32 * 0.5 + 0.1,
        }))
    }

    fn latent_encoder(
        &self,
        latents: ArrayView3<'_, f32>,
        mask: ArrayView2<'_, bool>,
        _wav_lens: ArrayView1<'_, f32>,
    ) -> Result<EncoderOutput> {
        let w = self.params[0].data()[0];
        let num_masked = mask.iter().filter(|&&m| m).count();
        Ok(EncoderOutput {
            embeddings: latents.mapv(|v| v * w),
            num_masked,
            ratio_masked: num_masked as f32 / mask.len() as f32,
        })
    }

    fn feature_projection(&self, embeddings: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        Ok(embeddings.to_owned())
    }

    fn target_quantizer(&self, masked_latents: ArrayView3<'_, f32>) -> Result<QuantizerOutput> {
        let stats = self.quantizer.then_some(QuantizerStats {
            diversity_loss: self.diversity_loss,
            code_perplexity: 12.0,
            prob_perplexity: 14.0,
            num_vars: 320,
            temperature: self.temperature,
        });
        Ok(QuantizerOutput { targets: masked_latents.to_owned(), stats })
    }

    fn has_quantizer(&self) -> bool {
        self.quantizer
    }

    fn set_quantizer_temperature(&mut self, temperature: f32) {
        self.temperature = temperature;
        self.log.lock().unwrap().temperatures.push(temperature);
    }

    fn parameters(&self) -> &[Tensor] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Tensor] {
        &mut self.params
    }

    fn backward(&mut self, _batch: &MaskedBatch, signal: &BackwardSignal) -> Result<()> {
        self.log.lock().unwrap().diversity_coeffs.push(signal.diversity_coeff);
        let g = if self.poison.load(Ordering::SeqCst) { f32::NAN } else { signal.scale };
        self.params[0].accumulate_grad(arr1(&[g]).view())
    }
}

/// Records the step of every all-reduce
struct CountingSync {
    rank: usize,
    reduces: Arc<Mutex<Vec<u64>>>,
}

impl GradientSync for CountingSync {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        2
    }

    fn all_reduce_grads(&mut self, _params: &mut [Tensor], step: u64) -> Result<()> {
        self.reduces.lock().unwrap().push(step);
        Ok(())
    }

    fn all_agree(&mut self, local: bool, _step: u64) -> Result<bool> {
        Ok(local)
    }

    fn barrier(&mut self) -> Result<()> {
        Ok(())
    }
}

fn probe_batch(rows: usize, time: usize, masked: &[usize]) -> MaskedBatch {
    let wavs = Array2::from_shape_fn((rows, time), |(b, t)| ((b * time + t) as f32 * 0.37).sin());
    let mut mask = Array2::from_elem((rows, time), false);
    for b in 0..rows {
        for &t in masked {
            mask[[b, t]] = true;
        }
    }
    MaskedBatch {
        ids: (0..rows).map(|b| format!("s{b}")).collect(),
        wavs,
        wav_lens: vec![time; rows],
        latent_lens: vec![time; rows],
        mask,
    }
}

fn batch() -> MaskedBatch {
    probe_batch(2, 10, &[1, 3, 5, 7])
}

fn config() -> PretrainConfig {
    PretrainConfig::new()
        .with_num_negatives(2)
        .with_lr_schedule(LrSchedule::Constant { lr: 0.1 })
}

fn trainer(model: ProbeModel, config: PretrainConfig) -> Pretrainer {
    Pretrainer::new(
        Box::new(model),
        Box::new(InfoNce::default()),
        Box::new(SGD::new(0.1, 0.0)),
        config,
    )
    .unwrap()
}

fn weight(trainer: &Pretrainer) -> f32 {
    trainer.params()[0].data()[0]
}

fn grads_are_zero(trainer: &Pretrainer) -> bool {
    trainer.params().iter().all(|p| p.grad().is_none_or(|g| g.iter().all(|&v| v == 0.0)))
}

#[test]
fn test_accumulation_window_steps_once() {
    let reduces = Arc::new(Mutex::new(Vec::new()));
    let sync = CountingSync { rank: 0, reduces: reduces.clone() };
    let mut t =
        trainer(ProbeModel::new(), config().with_accumulation_factor(4)).with_sync(Box::new(sync));
    let batch = batch();

    let mut losses = Vec::new();
    for i in 0..4 {
        let out = t.fit_batch(&batch).unwrap();
        assert_eq!(out.boundary, i == 3);
        losses.push(f64::from(out.objectives.unwrap().loss));
        if i < 3 {
            assert_eq!(t.step(), 0);
            assert_eq!(t.next_is_boundary(), i == 2);
            assert!(reduces.lock().unwrap().is_empty());
        }
    }

    assert_eq!(t.step(), 1);
    assert_eq!(t.state().micro_step, 4);
    assert_eq!(*reduces.lock().unwrap(), vec![0]);
    assert!(grads_are_zero(&t));
    // Four quarter-scaled gradients sum to one full gradient
    assert_abs_diff_eq!(weight(&t), 0.9, epsilon = 1e-6);
    let mean = losses.iter().sum::<f64>() / 4.0;
    assert_abs_diff_eq!(t.state().avg_train_loss.unwrap(), mean, epsilon = 1e-9);
}

#[test]
fn test_window_spans_epoch_boundary() {
    let mut t = trainer(ProbeModel::new(), config().with_accumulation_factor(3));
    let batch = batch();
    let first = t.train_epoch((0..2).map(|_| Ok::<_, Error>(batch.clone()))).unwrap();
    assert_eq!(first.steps, 0);
    let second = t.train_epoch((0..4).map(|_| Ok::<_, Error>(batch.clone()))).unwrap();
    assert_eq!(second.steps, 2);
    assert_eq!(t.state().epoch, 2);
    assert_eq!(t.state().micro_step, 6);
}

#[test]
fn test_nonfinite_window_is_skipped() {
    let model = ProbeModel::new();
    let poison = model.poison.clone();
    let mut t = trainer(model, config());
    let batch = batch();

    poison.store(true, Ordering::SeqCst);
    let out = t.fit_batch(&batch).unwrap();
    assert!(out.boundary && out.skipped);
    assert_eq!(t.step(), 1);
    assert_eq!(weight(&t), 1.0);
    assert!(grads_are_zero(&t));
    assert_eq!(t.state().consecutive_skipped, 1);
    assert_eq!(t.state().avg_train_loss, None);

    poison.store(false, Ordering::SeqCst);
    let out = t.fit_batch(&batch).unwrap();
    assert!(!out.skipped);
    assert_eq!(t.step(), 2);
    assert_abs_diff_eq!(weight(&t), 0.9, epsilon = 1e-6);
    assert_eq!(t.state().consecutive_skipped, 0);
    assert_eq!(t.state().total_skipped, 1);
    assert!(t.state().avg_train_loss.is_some());
}

#[test]
fn test_patience_exceeded_is_fatal() {
    let model = ProbeModel::new();
    model.poison.store(true, Ordering::SeqCst);
    let mut t = trainer(model, config().with_nonfinite_patience(2));
    let batch = batch();

    assert!(t.fit_batch(&batch).unwrap().skipped);
    assert!(t.fit_batch(&batch).unwrap().skipped);
    let err = t.fit_batch(&batch).unwrap_err();
    assert!(matches!(err, Error::NumericInstability { step: 2, .. }));
    assert!(err.to_string().contains("optimizer step"));
}

#[test]
fn test_loss_scale_backs_off_on_overflow() {
    let model = ProbeModel::new();
    let poison = model.poison.clone();
    let mut t = trainer(model, config().with_fp16());
    let initial = t.loss_scale();
    assert!(initial > 1.0);

    poison.store(true, Ordering::SeqCst);
    t.fit_batch(&batch()).unwrap();
    assert!(t.loss_scale() < initial);

    poison.store(false, Ordering::SeqCst);
    t.fit_batch(&batch()).unwrap();
    // Gradients are unscaled before the update
    assert_abs_diff_eq!(weight(&t), 0.9, epsilon = 1e-5);
}

#[test]
fn test_running_average() {
    let mut t = trainer(ProbeModel::new(), config());
    let batch = batch();
    let l1 = f64::from(t.fit_batch(&batch).unwrap().objectives.unwrap().loss);
    assert_abs_diff_eq!(t.state().avg_train_loss.unwrap(), l1, epsilon = 1e-12);
    let l2 = f64::from(t.fit_batch(&batch).unwrap().objectives.unwrap().loss);
    assert_abs_diff_eq!(t.state().avg_train_loss.unwrap(), 0.99 * l1 + 0.01 * l2, epsilon = 1e-9);
}

#[test]
fn test_log_cadence() {
    let tracker = InMemoryTracker::new();
    let mut t = trainer(ProbeModel::new(), config().with_log_interval(2))
        .with_tracker(Box::new(tracker.clone()));
    let batch = batch();

    let logs: Vec<_> = (0..4).map(|_| t.fit_batch(&batch).unwrap().log).collect();
    assert!(logs[0].is_none() && logs[2].is_none());
    let first = logs[1].as_ref().unwrap();
    let second = logs[3].as_ref().unwrap();
    assert_eq!((first.step, second.step), (2, 4));
    assert_eq!(first.run_time, None);
    assert!(second.run_time.is_some());
    assert_abs_diff_eq!(first.lr, 0.1);
    assert_eq!(first.num_masked, 8);
    assert_abs_diff_eq!(first.ratio_masked, 0.4);
    assert_eq!(first.temperature, None);

    let steps: Vec<u64> = tracker.values("loss").into_iter().map(|(s, _)| s).collect();
    assert_eq!(steps, vec![2, 4]);
    assert_eq!(tracker.values("avg_loss").len(), 2);
}

#[test]
fn test_side_effects_only_on_main() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = InMemoryTracker::new();
    let sync = CountingSync { rank: 1, reduces: Arc::new(Mutex::new(Vec::new())) };
    let mut t = trainer(ProbeModel::new(), config().with_log_interval(1))
        .with_sync(Box::new(sync))
        .with_tracker(Box::new(tracker.clone()))
        .with_checkpointer(Box::new(DirCheckpointer::new(dir.path()).unwrap()));

    assert!(!t.is_main());
    let out = t.fit_batch(&batch()).unwrap();
    assert!(out.log.is_some());
    t.on_validation_end(0.5).unwrap();

    assert!(tracker.records().is_empty());
    assert!(DirCheckpointer::new(dir.path()).unwrap().list().unwrap().is_empty());
}

#[test]
fn test_temperature_follows_step() {
    let model = ProbeModel::new().with_quantizer();
    let log = model.log.clone();
    let schedule = TemperatureSchedule { max: 2.0, min: 0.5, decay: 0.5 };
    let mut t = trainer(model, config().with_temperature(schedule).with_log_interval(1));
    let batch = batch();

    for _ in 0..3 {
        let out = t.fit_batch(&batch).unwrap();
        assert!(out.log.unwrap().temperature.is_some());
    }
    assert_eq!(log.lock().unwrap().temperatures, vec![2.0, 1.0, 0.5, 0.5]);
}

#[test]
fn test_diversity_term() {
    let model = ProbeModel::new().with_quantizer();
    let log = model.log.clone();
    let mut t = trainer(model, config().with_diversity_loss_weight(0.1));
    let o = t.fit_batch(&batch()).unwrap().objectives.unwrap();
    assert_abs_diff_eq!(o.total_loss, o.loss + DIVERSITY_LOSS * 0.1 * 8.0, epsilon = 1e-5);
    assert_abs_diff_eq!(log.lock().unwrap().diversity_coeffs[0], 0.8, epsilon = 1e-6);

    let model = ProbeModel::new().with_quantizer();
    let log = model.log.clone();
    let mut t = trainer(model, config().with_diversity_loss_weight(0.0));
    let o = t.fit_batch(&batch()).unwrap().objectives.unwrap();
    assert_eq!(o.total_loss, o.loss);
    assert_eq!(log.lock().unwrap().diversity_coeffs[0], 0.0);
}

#[test]
fn test_degenerate_batch_is_dropped_but_counted() {
    let mut t = trainer(ProbeModel::new(), config().with_accumulation_factor(2));
    let mut bad = batch();
    bad.mask = Array2::from_elem((2, 9), true);

    let out = t.fit_batch(&bad).unwrap();
    assert!(out.objectives.is_none());
    assert!(!out.boundary);
    assert_eq!(t.state().micro_step, 1);

    let out = t.fit_batch(&batch()).unwrap();
    assert!(out.boundary);
    assert_eq!(t.step(), 1);
    assert_abs_diff_eq!(weight(&t), 0.95, epsilon = 1e-6);
}

#[test]
fn test_single_masked_step_cannot_sample_negatives() {
    let mut t = trainer(ProbeModel::new(), config());
    let forward = t.compute_forward(&probe_batch(2, 10, &[4])).unwrap();
    let err = t.compute_objectives(&forward).unwrap_err();
    assert!(matches!(err, Error::DataShape { stage: crate::Stage::NegativeSampling, .. }));
}

#[test]
fn test_forward_gathers_masked_positions() {
    let t = trainer(ProbeModel::new(), config());
    let batch = batch();
    let forward = t.compute_forward(&batch).unwrap();
    assert_eq!(forward.embeddings.dim(), (2, 4, 2));
    assert_eq!(forward.targets.dim(), (2, 4, 2));
    assert_eq!(forward.num_masked, 8);

    let latents = ProbeModel::new().latent_extractor(batch.wavs.view()).unwrap();
    let expected = gather_masked(latents.view(), batch.mask.view()).unwrap();
    assert_eq!(forward.targets, expected);
}

#[test]
fn test_skip_batch_advances_window() {
    let mut t = trainer(ProbeModel::new(), config());
    let out = t.skip_batch().unwrap();
    assert!(out.boundary && !out.skipped);
    assert_eq!(t.step(), 1);
    assert_eq!(weight(&t), 1.0);
    assert_eq!(t.state().avg_train_loss, None);
}

#[test]
fn test_train_epoch_summary() {
    let mut t = trainer(ProbeModel::new(), config());
    let items: Vec<Result<MaskedBatch>> =
        vec![Ok(batch()), Err(Error::Audio("truncated".into())), Ok(batch())];
    let summary = t.train_epoch(items).unwrap();
    assert_eq!(summary.micro_batches, 3);
    assert_eq!(summary.dropped, 1);
    assert_eq!(summary.steps, 3);
    assert!(summary.mean_loss.is_some());

    let items: Vec<Result<MaskedBatch>> = vec![Err(Error::Config("bad".into()))];
    assert!(t.train_epoch(items).is_err());
}

#[test]
fn test_evaluate_leaves_state_alone() {
    let mut t = trainer(ProbeModel::new(), config());
    let mut bad = batch();
    bad.mask = Array2::from_elem((2, 9), true);

    let acc = t.evaluate(vec![Ok(batch()), Ok(bad.clone())]).unwrap();
    assert!(acc.is_some_and(|a| (0.0..=1.0).contains(&a)));
    assert_eq!(t.step(), 0);
    assert_eq!(t.state().micro_step, 0);
    assert!(grads_are_zero(&t));

    assert_eq!(t.evaluate(vec![Ok(bad)]).unwrap(), None);
}

#[test]
fn test_forward_on_collated_batch_gathers_equal_rows() {
    let stack = DownsamplingStack::default();
    let collator = Collator::new(stack.clone(), MaskGenerator::new(0.5, 2).unwrap());
    let samples: Vec<Sample> = [10, 14]
        .iter()
        .enumerate()
        .map(|(i, &steps)| {
            let len = min_input_length(&stack, steps);
            let waveform = Array1::from_shape_fn(len, |n| ((n + i) as f32 * 0.05).sin());
            Sample { id: format!("u{i}"), waveform, duration: len as f64 / 16_000.0 }
        })
        .collect();
    let mut rng = StdRng::seed_from_u64(21);
    let batch = collator.collate(&samples, &mut rng).unwrap();
    assert_eq!(batch.latent_lens, vec![10, 14]);
    let m = batch.num_masked_per_row();
    assert!(m >= 1 && m <= 10);

    let model = ReferenceModel::new(ReferenceModelConfig::default(), 3).unwrap();
    let t = Pretrainer::new(
        Box::new(model),
        Box::new(InfoNce::default()),
        Box::new(SGD::new(0.1, 0.0)),
        config(),
    )
    .unwrap();
    let forward = t.compute_forward(&batch).unwrap();
    assert_eq!(forward.embeddings.dim(), (2, m, 16));
    assert_eq!(forward.targets.dim(), (2, m, 16));
    assert_eq!(forward.num_masked, 2 * m);
}

#[test]
fn test_validation_keeps_training_negatives() {
    let mut plain = trainer(ProbeModel::new(), config());
    let mut validated = trainer(ProbeModel::new(), config());

    let first = validated.evaluate(vec![Ok(batch())]).unwrap();
    let second = validated.evaluate(vec![Ok(batch())]).unwrap();
    assert_eq!(first, second);
    assert_eq!(plain.rng.random::<u64>(), validated.rng.random::<u64>());
}

#[test]
fn test_replicas_skip_together_on_local_nonfinite_loss() {
    let replicas = ThreadGroup::new(2).unwrap();
    let handles: Vec<_> = replicas
        .into_iter()
        .map(|replica| {
            std::thread::spawn(move || {
                let diversity = if replica.rank() == 1 { f32::INFINITY } else { DIVERSITY_LOSS };
                let model = ProbeModel::new().with_quantizer().with_diversity_loss(diversity);
                let mut t = trainer(model, config().with_diversity_loss_weight(0.1))
                    .with_sync(Box::new(replica));
                let skipped = t.fit_batch(&batch()).unwrap().skipped;
                (skipped, t.step(), weight(&t), t.loss_scale())
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results[0], (true, 1, 1.0, 1.0));
    assert_eq!(results[0], results[1]);
}

#[test]
fn test_restore_roundtrip() {
    let mut t = trainer(ProbeModel::new(), config().with_fp16().with_accumulation_factor(4));
    let batch = batch();
    for _ in 0..6 {
        t.fit_batch(&batch).unwrap();
    }
    let ckpt = t.checkpoint(1, 0.5);
    assert_eq!(ckpt.meta.step, 1);

    let mut resumed = trainer(ProbeModel::new(), config().with_fp16().with_accumulation_factor(4));
    resumed.restore(&ckpt).unwrap();
    assert_eq!(resumed.step(), 1);
    assert_eq!(resumed.state().micro_step, 4);
    assert_eq!(resumed.state().avg_train_loss, t.state().avg_train_loss);
    assert_eq!(weight(&resumed), weight(&t));
    assert_eq!(resumed.loss_scale(), t.loss_scale());
    assert!(grads_are_zero(&resumed));
}

#[test]
fn test_restore_rejects_other_model() {
    let t = trainer(ProbeModel::new(), config());
    let mut ckpt = t.checkpoint(0, 0.0);
    ckpt.params.push(Tensor::zeros(3, true));
    let mut other = trainer(ProbeModel::new(), config());
    assert!(matches!(other.restore(&ckpt), Err(Error::Checkpoint(_))));
}

#[test]
fn test_fit_keeps_recent_checkpoints_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let batch = batch();
    let batch = &batch;
    let train = move |_: usize| (0..2).map(move |_| Ok::<_, Error>(batch.clone()));
    let valid = move |_: usize| (0..1).map(move |_| Ok::<_, Error>(batch.clone()));

    let mut t = trainer(ProbeModel::new(), config().with_keep_checkpoints(2))
        .with_checkpointer(Box::new(DirCheckpointer::new(dir.path()).unwrap()));
    let result = t.fit(3, train, valid).unwrap();
    assert_eq!(result.epochs_completed, 3);
    assert_eq!(result.steps, 6);
    assert_eq!(result.valid_accuracies.len(), 3);
    assert!(result.best_valid_accuracy().is_some());

    let metas = DirCheckpointer::new(dir.path()).unwrap().list().unwrap();
    let epochs: Vec<usize> = metas.iter().map(|m| m.epoch).collect();
    assert_eq!(epochs, vec![2, 3]);

    let mut resumed = trainer(ProbeModel::new(), config())
        .with_checkpointer(Box::new(DirCheckpointer::new(dir.path()).unwrap()));
    assert!(resumed.resume_latest().unwrap());
    assert_eq!(resumed.state().epoch, 3);
    assert_eq!(resumed.step(), 6);
    let result = resumed.fit(3, train, valid).unwrap();
    assert!(result.valid_accuracies.is_empty());
    assert_eq!(result.steps, 6);
}

#[test]
fn test_resume_without_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = trainer(ProbeModel::new(), config())
        .with_checkpointer(Box::new(DirCheckpointer::new(dir.path()).unwrap()));
    assert!(!t.resume_latest().unwrap());
    assert_eq!(t.step(), 0);
}
