//! End-to-end pretraining with the reference model and InfoNCE objective

use std::sync::Arc;

use w2v_pretrain::checkpoint::{Checkpointer, DirCheckpointer};
use w2v_pretrain::data::{
    partition_for_replica, AudioSource, Collator, DownsamplingStack, DynamicBatchSampler,
    InMemorySource, LoaderConfig, MaskGenerator, MaskedBatch, PrefetchLoader,
};
use w2v_pretrain::distributed::{GradientSync, ThreadGroup};
use w2v_pretrain::model::{InfoNce, ReferenceModel, ReferenceModelConfig};
use w2v_pretrain::optim::{AdamW, LrSchedule};
use w2v_pretrain::train::{PretrainConfig, Pretrainer};
use w2v_pretrain::Result;

const SAMPLE_RATE: u32 = 16_000;

fn stack() -> DownsamplingStack {
    DownsamplingStack::new(vec![8, 4], vec![4, 2]).expect("stack should be valid")
}

/// Twelve tones of 700..=1140 samples
fn source() -> Arc<dyn AudioSource> {
    let waves = (0..12).map(|i| {
        let len = 700 + i * 40;
        let freq = 0.01 + 0.003 * i as f32;
        let wave: Vec<f32> =
            (0..len).map(|n| (n as f32 * freq).sin() + 0.1 * (n as f32 * 0.37).cos()).collect();
        (format!("utt{i:02}"), wave)
    });
    Arc::new(InMemorySource::from_waveforms(waves, SAMPLE_RATE))
}

fn collator() -> Arc<Collator> {
    Arc::new(Collator::new(stack(), MaskGenerator::new(0.5, 4).expect("masking should be valid")))
}

fn config() -> PretrainConfig {
    PretrainConfig::new()
        .with_accumulation_factor(2)
        .with_num_negatives(4)
        .with_grad_clip(5.0)
        .with_log_interval(1)
        .with_lr_schedule(LrSchedule::Constant { lr: 1e-3 })
        .with_seed(11)
}

fn trainer() -> Pretrainer {
    let model = ReferenceModel::new(
        ReferenceModelConfig { stack: stack(), latent_dim: 8, hidden_dim: 12, context: 2 },
        5,
    )
    .expect("model should build");
    Pretrainer::new(
        Box::new(model),
        Box::new(InfoNce::new(0.1).expect("temperature should be valid")),
        Box::new(AdamW::default_params(1e-3)),
        config(),
    )
    .expect("trainer should build")
}

fn loader(
    source: &Arc<dyn AudioSource>,
    batches: Vec<Vec<usize>>,
    seed: u64,
) -> impl Iterator<Item = Result<MaskedBatch>> {
    PrefetchLoader::new(
        Arc::clone(source),
        collator(),
        batches,
        seed,
        LoaderConfig { num_workers: 2, prefetch: 2 },
    )
}

fn snapshot(trainer: &Pretrainer) -> Vec<Vec<f32>> {
    trainer.params().iter().map(|p| p.data().to_vec()).collect()
}

#[test]
fn test_fit_reference_model() {
    let source = source();
    let sampler =
        DynamicBatchSampler::new(source.durations(), 0.25, 2, 3).expect("sampler should build");
    let per_epoch = sampler.batches(0).len();
    assert!(per_epoch >= 3);

    let dir = tempfile::tempdir().expect("tempdir should be created");
    let checkpointer =
        DirCheckpointer::new(dir.path()).expect("checkpoint dir should be created");
    let mut trainer = trainer().with_checkpointer(Box::new(checkpointer));
    let before = snapshot(&trainer);

    let result = trainer
        .fit(
            2,
            |epoch| loader(&source, sampler.batches(epoch as u64), epoch as u64),
            |epoch| loader(&source, vec![vec![0, 1, 2], vec![9, 10, 11]], 1000 + epoch as u64),
        )
        .expect("training should succeed");

    assert_eq!(result.epochs_completed, 2);
    assert_eq!(result.steps, per_epoch as u64);
    assert_eq!(result.skipped_steps, 0);
    assert!(result.avg_train_loss.is_some_and(f64::is_finite));
    assert_eq!(result.valid_accuracies.len(), 2);
    assert!(result.valid_accuracies.iter().all(|a| (0.0..=1.0).contains(a)));

    let after = snapshot(&trainer);
    // Frozen extractor stays put, trainable parameters move
    assert_eq!(before[0], after[0]);
    assert!(before[1..].iter().zip(&after[1..]).all(|(b, a)| b != a));

    let metas = DirCheckpointer::new(dir.path())
        .expect("checkpoint dir")
        .list()
        .expect("list should succeed");
    assert_eq!(metas.len(), 2);
    assert_eq!(metas.last().map(|m| m.step), Some(result.steps));
}

#[test]
fn test_resumed_run_matches_restored_params() {
    let source = source();
    let sampler =
        DynamicBatchSampler::new(source.durations(), 0.25, 2, 3).expect("sampler should build");
    let dir = tempfile::tempdir().expect("tempdir should be created");

    let mut first =
        trainer().with_checkpointer(Box::new(DirCheckpointer::new(dir.path()).expect("dir")));
    first
        .fit(
            1,
            |epoch| loader(&source, sampler.batches(epoch as u64), 0),
            |_| loader(&source, vec![vec![0, 1, 2]], 1),
        )
        .expect("training should succeed");

    let mut resumed =
        trainer().with_checkpointer(Box::new(DirCheckpointer::new(dir.path()).expect("dir")));
    assert!(resumed.resume_latest().expect("resume should succeed"));
    assert_eq!(resumed.state().epoch, 1);
    assert_eq!(resumed.step(), first.step());
    assert_eq!(snapshot(&resumed), snapshot(&first));
}

#[test]
fn test_replicas_stay_in_lockstep() {
    let source = source();
    let sampler =
        DynamicBatchSampler::new(source.durations(), 0.25, 2, 3).expect("sampler should build");
    let batches = sampler.batches(0);
    let replicas = ThreadGroup::new(2).expect("group should build");

    let results: Vec<(u64, Vec<Vec<f32>>)> = std::thread::scope(|scope| {
        let handles: Vec<_> = replicas
            .into_iter()
            .map(|replica| {
                let source = &source;
                let batches = &batches;
                scope.spawn(move || {
                    let rank = replica.rank();
                    let part =
                        partition_for_replica(batches, rank, 2).expect("partition should succeed");
                    let mut trainer = trainer().with_sync(Box::new(replica));
                    trainer
                        .fit(
                            1,
                            |_| loader(source, part.clone(), rank as u64),
                            |_| std::iter::empty::<Result<MaskedBatch>>(),
                        )
                        .expect("training should succeed");
                    (trainer.step(), snapshot(&trainer))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("replica should not panic")).collect()
    });

    let (step0, params0) = &results[0];
    let (step1, params1) = &results[1];
    assert!(*step0 > 0);
    assert_eq!(step0, step1);
    assert_eq!(params0, params1);
}
