//! Build pipeline components from configuration

use std::fs;
use std::path::Path;

use super::schema::{OptimizerSpec, PretrainSpec};
use super::validate::validate_spec;
use crate::autograd::MixedPrecisionConfig;
use crate::data::{Collator, DynamicBatchSampler, MaskGenerator};
use crate::error::{Error, Result};
use crate::model::{InfoNce, ReferenceModel, ReferenceModelConfig};
use crate::optim::{AdamW, Optimizer, SGD};
use crate::train::PretrainConfig;

/// Read, parse and range-check a YAML spec
///
/// Manifest paths are not checked here; see [`validate_spec`].
pub fn load_spec(path: impl AsRef<Path>) -> Result<PretrainSpec> {
    let path = path.as_ref();
    let yaml = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file {}: {e}", path.display())))?;
    parse_spec(&yaml)
}

/// Parse and range-check a YAML spec from a string
pub fn parse_spec(yaml: &str) -> Result<PretrainSpec> {
    let spec: PretrainSpec = serde_yaml::from_str(yaml)
        .map_err(|e| Error::Config(format!("Failed to parse YAML config: {e}")))?;
    validate_spec(&spec, false)?;
    Ok(spec)
}

/// Collator with the spec's downsampling stack and masking
pub fn build_collator(spec: &PretrainSpec) -> Result<Collator> {
    let masker = MaskGenerator::new(spec.masking.mask_prob, spec.masking.mask_length)?;
    let stack = spec.model.stack();
    stack.validate()?;
    Ok(Collator::new(stack, masker))
}

/// Dynamic batch sampler over `durations`
pub fn build_sampler(spec: &PretrainSpec, durations: Vec<f64>) -> Result<DynamicBatchSampler> {
    let sampler = DynamicBatchSampler::new(
        durations,
        spec.data.seconds_per_batch,
        spec.data.num_buckets,
        spec.training.seed,
    )?;
    Ok(sampler.with_ordering(spec.data.ordering))
}

/// Fixed-size validation batches over `len` sorted samples
pub fn valid_batches(len: usize, batch_size: usize) -> Vec<Vec<usize>> {
    let indices: Vec<usize> = (0..len).collect();
    indices.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect()
}

/// Engine settings from the `objective`, `optimizer`, `training` and
/// `checkpoint` sections
pub fn build_pretrain_config(spec: &PretrainSpec) -> PretrainConfig {
    let mut config = PretrainConfig::new()
        .with_accumulation_factor(spec.training.accumulation_factor)
        .with_diversity_loss_weight(spec.objective.diversity_loss_weight)
        .with_num_negatives(spec.objective.num_negatives)
        .with_log_interval(spec.training.log_interval)
        .with_nonfinite_patience(spec.training.nonfinite_patience)
        .with_keep_checkpoints(spec.checkpoint.keep)
        .with_precision(MixedPrecisionConfig::from_flag(spec.training.mixed_precision))
        .with_lr_schedule(spec.optimizer.lr_schedule.clone())
        .with_temperature(spec.objective.gumbel)
        .with_seed(spec.training.seed);
    if let Some(clip) = spec.optimizer.max_grad_norm {
        config = config.with_grad_clip(clip);
    }
    config
}

/// Build optimizer from configuration
pub fn build_optimizer(spec: &OptimizerSpec) -> Result<Box<dyn Optimizer>> {
    let lr = spec.lr_schedule.peak_lr();
    match spec.name.to_lowercase().as_str() {
        "sgd" => Ok(Box::new(SGD::new(lr, spec.momentum))),
        "adamw" => {
            Ok(Box::new(AdamW::new(lr, spec.beta1, spec.beta2, spec.eps, spec.weight_decay)))
        }
        name => Err(Error::Config(format!("Unknown optimizer: {name}. Supported: sgd, adamw"))),
    }
}

/// Reference model with the spec's widths; every replica uses the same seed
pub fn build_model(spec: &PretrainSpec) -> Result<ReferenceModel> {
    let config = ReferenceModelConfig {
        stack: spec.model.stack(),
        latent_dim: spec.model.latent_dim,
        hidden_dim: spec.model.hidden_dim,
        context: spec.model.context,
    };
    ReferenceModel::new(config, spec.training.seed)
}

pub fn build_objective(spec: &PretrainSpec) -> Result<InfoNce> {
    InfoNce::new(spec.objective.logit_temperature)
}
