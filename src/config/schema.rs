//! YAML schema for pretraining runs
//!
//! Every section except `data` is optional; omitted fields take the values
//! of the LibriSpeech base recipe.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::data::{BatchOrdering, DownsamplingStack, DurationFilter, LoaderConfig};
use crate::optim::{LrSchedule, TemperatureSchedule};

/// Complete pretraining specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainSpec {
    pub data: DataSpec,

    #[serde(default)]
    pub masking: MaskingSpec,

    #[serde(default)]
    pub model: ModelSpec,

    #[serde(default)]
    pub objective: ObjectiveSpec,

    #[serde(default)]
    pub optimizer: OptimizerSpec,

    #[serde(default)]
    pub training: TrainingSpec,

    #[serde(default)]
    pub checkpoint: CheckpointSpec,

    #[serde(default)]
    pub tracking: TrackingSpec,

    #[serde(default)]
    pub distributed: DistributedSpec,
}

/// Manifests and batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSpec {
    /// JSON-lines manifest of training utterances
    pub train_manifest: PathBuf,

    /// JSON-lines manifest of validation utterances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_manifest: Option<PathBuf>,

    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: u32,

    /// Audio seconds per training batch
    #[serde(default = "default_seconds_per_batch")]
    pub seconds_per_batch: f64,

    #[serde(default = "default_num_buckets")]
    pub num_buckets: usize,

    #[serde(default)]
    pub ordering: BatchOrdering,

    /// Fixed batch size for validation
    #[serde(default = "default_valid_batch_size")]
    pub valid_batch_size: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avoid_if_shorter_than: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avoid_if_longer_than: Option<f64>,

    #[serde(default)]
    pub loader: LoaderConfig,
}

impl DataSpec {
    pub fn duration_filter(&self) -> DurationFilter {
        DurationFilter::new(self.avoid_if_shorter_than, self.avoid_if_longer_than)
    }
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_seconds_per_batch() -> f64 {
    200.0
}

fn default_num_buckets() -> usize {
    70
}

fn default_valid_batch_size() -> usize {
    4
}

/// Span masking over the latent time axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaskingSpec {
    pub mask_prob: f32,
    pub mask_length: usize,
}

impl Default for MaskingSpec {
    fn default() -> Self {
        Self { mask_prob: 0.65, mask_length: 10 }
    }
}

/// Feature extractor geometry and reference model widths
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default = "default_kernels")]
    pub kernels: Vec<usize>,

    #[serde(default = "default_strides")]
    pub strides: Vec<usize>,

    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,

    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,

    #[serde(default = "default_context")]
    pub context: usize,
}

impl ModelSpec {
    pub fn stack(&self) -> DownsamplingStack {
        DownsamplingStack { kernels: self.kernels.clone(), strides: self.strides.clone() }
    }
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            kernels: default_kernels(),
            strides: default_strides(),
            latent_dim: default_latent_dim(),
            hidden_dim: default_hidden_dim(),
            context: default_context(),
        }
    }
}

fn default_kernels() -> Vec<usize> {
    DownsamplingStack::default().kernels
}

fn default_strides() -> Vec<usize> {
    DownsamplingStack::default().strides
}

fn default_latent_dim() -> usize {
    16
}

fn default_hidden_dim() -> usize {
    32
}

fn default_context() -> usize {
    2
}

/// Contrastive objective and quantizer annealing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveSpec {
    #[serde(default = "default_num_negatives")]
    pub num_negatives: usize,

    #[serde(default = "default_diversity_weight")]
    pub diversity_loss_weight: f32,

    /// Softmax temperature of the InfoNCE logits
    #[serde(default = "default_logit_temperature")]
    pub logit_temperature: f32,

    /// Gumbel-softmax temperature schedule of the quantizer
    #[serde(default)]
    pub gumbel: TemperatureSchedule,
}

impl Default for ObjectiveSpec {
    fn default() -> Self {
        Self {
            num_negatives: default_num_negatives(),
            diversity_loss_weight: default_diversity_weight(),
            logit_temperature: default_logit_temperature(),
            gumbel: TemperatureSchedule::default(),
        }
    }
}

fn default_num_negatives() -> usize {
    100
}

fn default_diversity_weight() -> f32 {
    0.1
}

fn default_logit_temperature() -> f32 {
    0.1
}

/// Optimizer choice and learning-rate schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    /// `adamw` or `sgd`
    #[serde(default = "default_optimizer")]
    pub name: String,

    #[serde(default)]
    pub lr_schedule: LrSchedule,

    #[serde(default = "default_beta1")]
    pub beta1: f32,

    #[serde(default = "default_beta2")]
    pub beta2: f32,

    #[serde(default = "default_eps")]
    pub eps: f32,

    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,

    /// SGD momentum
    #[serde(default)]
    pub momentum: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_grad_norm: Option<f32>,
}

impl Default for OptimizerSpec {
    fn default() -> Self {
        Self {
            name: default_optimizer(),
            lr_schedule: LrSchedule::default(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: default_weight_decay(),
            momentum: 0.0,
            max_grad_norm: None,
        }
    }
}

fn default_optimizer() -> String {
    "adamw".to_string()
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.98
}

fn default_eps() -> f32 {
    1e-6
}

fn default_weight_decay() -> f32 {
    0.01
}

/// Loop control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSpec {
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_accumulation")]
    pub accumulation_factor: usize,

    /// fp16 autocast with dynamic loss scaling
    #[serde(default)]
    pub mixed_precision: bool,

    #[serde(default = "default_log_interval")]
    pub log_interval: u64,

    #[serde(default = "default_patience")]
    pub nonfinite_patience: u32,

    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for TrainingSpec {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            accumulation_factor: default_accumulation(),
            mixed_precision: false,
            log_interval: default_log_interval(),
            nonfinite_patience: default_patience(),
            seed: default_seed(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_epochs() -> usize {
    100
}

fn default_accumulation() -> usize {
    1
}

fn default_log_interval() -> u64 {
    100
}

fn default_patience() -> u32 {
    10
}

fn default_seed() -> u64 {
    1986
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results/w2v2_base")
}

/// Checkpoint retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSpec {
    /// Defaults to `<output_dir>/save`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    #[serde(default = "default_keep")]
    pub keep: usize,

    /// Continue from the latest checkpoint when one exists
    #[serde(default = "default_true")]
    pub resume: bool,
}

impl Default for CheckpointSpec {
    fn default() -> Self {
        Self { dir: None, keep: default_keep(), resume: true }
    }
}

fn default_keep() -> usize {
    2
}

fn default_true() -> bool {
    true
}

/// Metric logging on the main replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Defaults to `<output_dir>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for TrackingSpec {
    fn default() -> Self {
        Self { enabled: true, dir: None }
    }
}

/// Data-parallel replicas run as threads of one process
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistributedSpec {
    #[serde(default = "default_world_size")]
    pub world_size: usize,
}

impl Default for DistributedSpec {
    fn default() -> Self {
        Self { world_size: default_world_size() }
    }
}

fn default_world_size() -> usize {
    1
}

impl PretrainSpec {
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint.dir.clone().unwrap_or_else(|| self.training.output_dir.join("save"))
    }

    pub fn tracking_dir(&self) -> PathBuf {
        self.tracking.dir.clone().unwrap_or_else(|| self.training.output_dir.clone())
    }
}
