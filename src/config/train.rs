//! Pretraining from a YAML specification

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::builder::{
    build_collator, build_model, build_objective, build_optimizer, build_pretrain_config,
    build_sampler, load_spec, valid_batches,
};
use super::schema::PretrainSpec;
use super::validate::validate_spec;
use crate::checkpoint::DirCheckpointer;
use crate::data::{
    partition_for_replica, AudioSource, Collator, DynamicBatchSampler, LoaderConfig, ManifestSource,
    MaskedBatch, PrefetchLoader,
};
use crate::distributed::{run_on_main, GradientSync, LocalSync, ThreadGroup};
use crate::error::{Error, Result};
use crate::tracking::{ExperimentTracker, JsonlTracker};
use crate::train::{PretrainResult, Pretrainer};

type BatchStream = Box<dyn Iterator<Item = Result<MaskedBatch>>>;

/// Train from a YAML configuration file
///
/// # Example
///
/// ```no_run
/// use w2v_pretrain::config::train_from_yaml;
///
/// let result = train_from_yaml("pretrain.yaml")?;
/// println!("{} steps", result.steps);
/// # Ok::<(), w2v_pretrain::Error>(())
/// ```
pub fn train_from_yaml(path: impl AsRef<Path>) -> Result<PretrainResult> {
    let spec = load_spec(path)?;
    train_from_spec(&spec)
}

/// Everything the replicas share read-only
struct Pipeline {
    train: Arc<dyn AudioSource>,
    valid: Option<Arc<dyn AudioSource>>,
    collator: Arc<Collator>,
    sampler: DynamicBatchSampler,
    loader: LoaderConfig,
}

/// Train with an already-loaded spec
///
/// With `distributed.world_size > 1` every replica runs on its own thread
/// and gradients are averaged at accumulation boundaries. The result is the
/// main replica's.
pub fn train_from_spec(spec: &PretrainSpec) -> Result<PretrainResult> {
    validate_spec(spec, true)?;

    let filter = spec.data.duration_filter();
    let train =
        ManifestSource::from_jsonl(&spec.data.train_manifest, filter, spec.data.sample_rate_hz)?;
    if train.is_empty() {
        return Err(Error::Config(format!(
            "no training utterances left in {} after duration filtering",
            spec.data.train_manifest.display()
        )));
    }
    let valid = match &spec.data.valid_manifest {
        Some(path) => Some(ManifestSource::from_jsonl(path, filter, spec.data.sample_rate_hz)?),
        None => None,
    };
    let sampler = build_sampler(spec, train.durations())?;
    let pipeline = Pipeline {
        train: Arc::new(train),
        valid: valid.map(|v| Arc::new(v) as Arc<dyn AudioSource>),
        collator: Arc::new(build_collator(spec)?),
        sampler,
        loader: spec.data.loader,
    };

    let world_size = spec.distributed.world_size;
    if world_size == 1 {
        return run_replica(spec, &pipeline, Box::new(LocalSync));
    }

    let replicas = ThreadGroup::new(world_size)?;
    let results: Vec<Result<PretrainResult>> = std::thread::scope(|scope| {
        let handles: Vec<_> = replicas
            .into_iter()
            .map(|replica| {
                let pipeline = &pipeline;
                scope.spawn(move || run_replica(spec, pipeline, Box::new(replica)))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(Error::DistributedDesync("replica thread panicked".into()))
                })
            })
            .collect()
    });

    let mut main = None;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(r) if rank == 0 => main = Some(r),
            Ok(_) => {}
            Err(e) => {
                tracing::error!(rank, error = %e, "Replica failed");
                return Err(e);
            }
        }
    }
    main.ok_or_else(|| Error::DistributedDesync("main replica produced no result".into()))
}

fn run_replica(
    spec: &PretrainSpec,
    pipeline: &Pipeline,
    mut sync: Box<dyn GradientSync>,
) -> Result<PretrainResult> {
    let rank = sync.rank();
    let world_size = sync.world_size();
    let output_dir = spec.training.output_dir.clone();
    run_on_main(sync.as_mut(), || {
        fs::create_dir_all(&output_dir)?;
        fs::write(output_dir.join("hyperparams.yaml"), serde_yaml::to_string(spec)?)?;
        Ok(())
    })?;

    let mut trainer = Pretrainer::new(
        Box::new(build_model(spec)?),
        Box::new(build_objective(spec)?),
        build_optimizer(&spec.optimizer)?,
        build_pretrain_config(spec),
    )?
    .with_sync(sync)
    .with_checkpointer(Box::new(DirCheckpointer::new(spec.checkpoint_dir())?));

    if trainer.is_main() && spec.tracking.enabled {
        let mut tracker = JsonlTracker::new(spec.tracking_dir())?;
        tracker.log_params(&run_params(spec, pipeline))?;
        trainer = trainer.with_tracker(Box::new(tracker));
    }
    if spec.checkpoint.resume && trainer.resume_latest()? {
        tracing::info!(rank, epoch = trainer.state().epoch, step = trainer.step(), "Resuming");
    }

    let seed = spec.training.seed;
    let train_stream = |epoch: usize| -> BatchStream {
        let batches = pipeline.sampler.batches(epoch as u64);
        match partition_for_replica(&batches, rank, world_size) {
            Ok(part) => Box::new(PrefetchLoader::new(
                Arc::clone(&pipeline.train),
                Arc::clone(&pipeline.collator),
                part,
                loader_seed(seed, epoch, rank, world_size),
                pipeline.loader,
            )),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    };
    let valid_stream =
        |epoch: usize| full_valid_stream(pipeline, spec.data.valid_batch_size, seed, epoch);

    let result = trainer.fit(spec.training.epochs, train_stream, valid_stream)?;
    if trainer.is_main() {
        tracing::info!(
            epochs = result.epochs_completed,
            steps = result.steps,
            skipped = result.skipped_steps,
            avg_loss = result.avg_train_loss,
            best_valid_accuracy = result.best_valid_accuracy(),
            elapsed_secs = result.elapsed_secs,
            "Training complete"
        );
    }
    Ok(result)
}

/// The whole validation set, identically masked on every replica
fn full_valid_stream(
    pipeline: &Pipeline,
    batch_size: usize,
    seed: u64,
    epoch: usize,
) -> BatchStream {
    let Some(source) = &pipeline.valid else {
        return Box::new(std::iter::empty());
    };
    Box::new(PrefetchLoader::new(
        Arc::clone(source),
        Arc::clone(&pipeline.collator),
        valid_batches(source.len(), batch_size),
        loader_seed(seed ^ 0x5EED, epoch, 0, 1),
        pipeline.loader,
    ))
}

/// Mask seed of one replica's epoch
fn loader_seed(seed: u64, epoch: usize, rank: usize, world_size: usize) -> u64 {
    seed.wrapping_add(((epoch * world_size + rank) as u64).wrapping_mul(1_000_003))
}

fn run_params(spec: &PretrainSpec, pipeline: &Pipeline) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut put = |key: &str, value: String| {
        params.insert(key.to_string(), value);
    };
    put("train_utterances", pipeline.train.len().to_string());
    put("seconds_per_batch", spec.data.seconds_per_batch.to_string());
    put("mask_prob", spec.masking.mask_prob.to_string());
    put("mask_length", spec.masking.mask_length.to_string());
    put("num_negatives", spec.objective.num_negatives.to_string());
    put("diversity_loss_weight", spec.objective.diversity_loss_weight.to_string());
    put("optimizer", spec.optimizer.name.clone());
    put("peak_lr", spec.optimizer.lr_schedule.peak_lr().to_string());
    put("accumulation_factor", spec.training.accumulation_factor.to_string());
    put("mixed_precision", spec.training.mixed_precision.to_string());
    put("world_size", spec.distributed.world_size.to_string());
    put("seed", spec.training.seed.to_string());
    params
}
