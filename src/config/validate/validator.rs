//! Configuration validation logic

use super::error::ValidationError;
use crate::config::schema::PretrainSpec;
use crate::error::Error;

/// Validate a pretraining specification
///
/// Checks:
/// - Manifest paths exist (when `check_paths` is set)
/// - Numeric values are in valid ranges
/// - Enums match allowed values
pub fn validate_spec(spec: &PretrainSpec, check_paths: bool) -> Result<(), ValidationError> {
    let data = &spec.data;
    if check_paths {
        if !data.train_manifest.exists() {
            return Err(ValidationError::TrainManifestNotFound(
                data.train_manifest.display().to_string(),
            ));
        }
        if let Some(valid) = &data.valid_manifest {
            if !valid.exists() {
                return Err(ValidationError::ValidManifestNotFound(valid.display().to_string()));
            }
        }
    }

    if data.sample_rate_hz == 0 {
        return Err(ValidationError::InvalidSampleRate(data.sample_rate_hz));
    }
    if !(data.seconds_per_batch > 0.0) {
        return Err(ValidationError::InvalidBatchSeconds(data.seconds_per_batch));
    }
    if data.num_buckets == 0 {
        return Err(ValidationError::InvalidBuckets(data.num_buckets));
    }
    if data.valid_batch_size == 0 {
        return Err(ValidationError::InvalidValidBatchSize(data.valid_batch_size));
    }
    if let (Some(min), Some(max)) = (data.avoid_if_shorter_than, data.avoid_if_longer_than) {
        if min > max {
            return Err(ValidationError::InvalidDurationWindow { min, max });
        }
    }

    let masking = &spec.masking;
    if !(masking.mask_prob > 0.0 && masking.mask_prob <= 1.0) {
        return Err(ValidationError::InvalidMaskProb(masking.mask_prob));
    }
    if masking.mask_length == 0 {
        return Err(ValidationError::InvalidMaskLength(masking.mask_length));
    }

    spec.model.stack().validate().map_err(|e| match e {
        Error::Config(reason) => ValidationError::InvalidStack(reason),
        other => ValidationError::InvalidStack(other.to_string()),
    })?;
    for width in [spec.model.latent_dim, spec.model.hidden_dim] {
        if width == 0 {
            return Err(ValidationError::InvalidModelWidth(width));
        }
    }

    let objective = &spec.objective;
    if objective.num_negatives == 0 {
        return Err(ValidationError::InvalidNegatives(objective.num_negatives));
    }
    if !objective.diversity_loss_weight.is_finite() || objective.diversity_loss_weight < 0.0 {
        return Err(ValidationError::InvalidDiversityWeight(objective.diversity_loss_weight));
    }
    if !(objective.logit_temperature > 0.0) {
        return Err(ValidationError::InvalidTemperature(objective.logit_temperature));
    }
    let gumbel = objective.gumbel;
    if !(gumbel.min > 0.0
        && gumbel.min <= gumbel.max
        && gumbel.decay > 0.0
        && gumbel.decay <= 1.0)
    {
        return Err(ValidationError::InvalidGumbelSchedule {
            max: gumbel.max,
            min: gumbel.min,
            decay: gumbel.decay,
        });
    }

    let optimizer = &spec.optimizer;
    let valid_optimizers = ["adamw", "sgd"];
    if !valid_optimizers.contains(&optimizer.name.to_lowercase().as_str()) {
        return Err(ValidationError::InvalidOptimizer(optimizer.name.clone()));
    }
    let peak = optimizer.lr_schedule.peak_lr();
    if !(peak > 0.0 && peak <= 1.0) {
        return Err(ValidationError::InvalidLearningRate(peak));
    }
    if let Some(clip) = optimizer.max_grad_norm {
        if !(clip > 0.0) {
            return Err(ValidationError::InvalidGradClip(clip));
        }
    }

    let training = &spec.training;
    if training.epochs == 0 {
        return Err(ValidationError::InvalidEpochs(training.epochs));
    }
    if training.accumulation_factor == 0 {
        return Err(ValidationError::InvalidAccumulation(training.accumulation_factor));
    }
    if training.log_interval == 0 {
        return Err(ValidationError::InvalidLogInterval(training.log_interval));
    }

    if spec.checkpoint.keep == 0 {
        return Err(ValidationError::InvalidKeep(spec.checkpoint.keep));
    }
    if spec.distributed.world_size == 0 {
        return Err(ValidationError::InvalidWorldSize(spec.distributed.world_size));
    }

    Ok(())
}
