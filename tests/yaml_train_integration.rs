//! Training from a YAML config over WAV files listed in JSONL manifests

use std::fs;
use std::path::Path;

use w2v_pretrain::checkpoint::{Checkpointer, DirCheckpointer};
use w2v_pretrain::config::{load_spec, train_from_spec, train_from_yaml};
use w2v_pretrain::data::wav::encode_wav_pcm16;
use w2v_pretrain::tracking::JsonlTracker;
use w2v_pretrain::Error;

const SAMPLE_RATE: u32 = 16_000;

/// Write `count` tones and a manifest listing them
fn write_corpus(dir: &Path, name: &str, count: usize) {
    let mut manifest = String::new();
    for i in 0..count {
        let len = 720 + i * 48;
        let freq = 0.02 + 0.004 * i as f32;
        let samples: Vec<f32> = (0..len).map(|n| 0.5 * (n as f32 * freq).sin()).collect();
        let file = format!("{name}_{i:02}.wav");
        fs::write(dir.join(&file), encode_wav_pcm16(&samples, SAMPLE_RATE))
            .expect("wav should be written");
        manifest.push_str(&format!(
            "{{\"id\": \"{name}_{i:02}\", \"duration\": {}, \"wav\": \"{file}\"}}\n",
            len as f64 / f64::from(SAMPLE_RATE)
        ));
    }
    fs::write(dir.join(format!("{name}.jsonl")), manifest).expect("manifest should be written");
}

fn write_config(dir: &Path, epochs: usize, world_size: usize) -> std::path::PathBuf {
    let yaml = format!(
        r#"
data:
  train_manifest: {root}/train.jsonl
  valid_manifest: {root}/dev.jsonl
  sample_rate_hz: 16000
  seconds_per_batch: 0.25
  num_buckets: 2
  valid_batch_size: 2
  loader:
    num_workers: 1
    prefetch: 2
masking:
  mask_prob: 0.5
  mask_length: 4
model:
  kernels: [8, 4]
  strides: [4, 2]
  latent_dim: 8
  hidden_dim: 12
objective:
  num_negatives: 4
optimizer:
  name: adamw
  max_grad_norm: 5.0
  lr_schedule:
    kind: linear_warmup
    lr: 0.001
    warmup_steps: 2
training:
  epochs: {epochs}
  log_interval: 1
  seed: 3
  output_dir: {root}/out
distributed:
  world_size: {world_size}
"#,
        root = dir.display()
    );
    let path = dir.join("hparams.yaml");
    fs::write(&path, yaml).expect("config should be written");
    path
}

fn corpus() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    write_corpus(dir.path(), "train", 10);
    write_corpus(dir.path(), "dev", 4);
    dir
}

#[test]
fn test_train_from_yaml_writes_run_artifacts() {
    let dir = corpus();
    let config = write_config(dir.path(), 2, 1);

    let result = train_from_yaml(&config).expect("training should succeed");
    assert_eq!(result.epochs_completed, 2);
    assert!(result.steps > 0);
    assert_eq!(result.valid_accuracies.len(), 2);

    let out = dir.path().join("out");
    let saved = load_spec(out.join("hyperparams.yaml")).expect("hyperparams should round-trip");
    assert_eq!(saved.training.epochs, 2);
    assert_eq!(saved.model.strides, vec![4, 2]);

    let records =
        JsonlTracker::read_records(out.join("metrics.jsonl")).expect("metrics should parse");
    let losses = records.iter().filter(|r| r.metrics.contains_key("loss")).count() as u64;
    assert_eq!(losses, result.steps);
    assert_eq!(records.iter().filter(|r| r.metrics.contains_key("valid_accuracy")).count(), 2);

    let metas = DirCheckpointer::new(out.join("save"))
        .expect("save dir")
        .list()
        .expect("list should succeed");
    assert_eq!(metas.iter().map(|m| m.epoch).collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn test_rerun_resumes_from_latest_checkpoint() {
    let dir = corpus();
    let first = train_from_yaml(write_config(dir.path(), 1, 1)).expect("first run should succeed");
    assert_eq!(first.epochs_completed, 1);

    let second =
        train_from_yaml(write_config(dir.path(), 2, 1)).expect("second run should succeed");
    assert_eq!(second.epochs_completed, 2);
    assert_eq!(second.valid_accuracies.len(), 1);
    assert_eq!(second.steps, 2 * first.steps);

    let mut spec = load_spec(write_config(dir.path(), 2, 1)).expect("config should load");
    spec.checkpoint.resume = false;
    spec.training.epochs = 1;
    let fresh = train_from_spec(&spec).expect("fresh run should succeed");
    assert_eq!(fresh.steps, first.steps);
}

#[test]
fn test_two_replicas_train_from_yaml() {
    let dir = corpus();
    let result = train_from_yaml(write_config(dir.path(), 1, 2))
        .expect("replicated training should succeed");
    assert_eq!(result.epochs_completed, 1);
    assert!(result.steps > 0);
}

#[test]
fn test_missing_manifest_is_config_error() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let err = train_from_yaml(write_config(dir.path(), 1, 1)).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
