//! Info command implementation

use crate::cli::logging::log;
use crate::cli::LogLevel;
use crate::config::{load_spec, InfoArgs, PretrainSpec};
use crate::data::{latent_length, min_input_length};

/// Format the data section
pub fn format_data_info(spec: &PretrainSpec) -> String {
    let data = &spec.data;
    let mut lines = vec![format!("  Training manifest: {}", data.train_manifest.display())];
    if let Some(valid) = &data.valid_manifest {
        lines.push(format!("  Validation manifest: {}", valid.display()));
    }
    lines.push(format!("  Seconds per batch: {}", data.seconds_per_batch));
    lines.push(format!("  Buckets: {} ({:?} order)", data.num_buckets, data.ordering));
    lines.push(format!(
        "  Duration window: {:?} .. {:?} s",
        data.avoid_if_shorter_than, data.avoid_if_longer_than
    ));
    lines.join("\n")
}

/// Format masking and latent geometry
pub fn format_masking_info(spec: &PretrainSpec) -> String {
    let stack = spec.model.stack();
    let stride = stack.total_stride();
    let rate = spec.data.sample_rate_hz;
    let one_second = latent_length(&stack, rate as usize);
    [
        format!("  Mask: p={} length={}", spec.masking.mask_prob, spec.masking.mask_length),
        format!("  Downsampling: kernels {:?} strides {:?}", stack.kernels, stack.strides),
        format!(
            "  Latent frame: {stride} samples ({:.1} ms)",
            stride as f64 * 1000.0 / f64::from(rate)
        ),
        format!("  Latent steps per second: {one_second}"),
        format!(
            "  Shortest input with 2 latent steps: {} samples",
            min_input_length(&stack, 2)
        ),
    ]
    .join("\n")
}

/// Format objective and optimizer settings
pub fn format_optimization_info(spec: &PretrainSpec) -> String {
    let mut lines = vec![
        format!("  Negatives: {}", spec.objective.num_negatives),
        format!("  Diversity loss weight: {}", spec.objective.diversity_loss_weight),
        format!(
            "  Optimizer: {} (peak lr={})",
            spec.optimizer.name,
            spec.optimizer.lr_schedule.peak_lr()
        ),
        format!("  Accumulation factor: {}", spec.training.accumulation_factor),
        format!("  Mixed precision: {}", spec.training.mixed_precision),
    ];
    if let Some(clip) = spec.optimizer.max_grad_norm {
        lines.push(format!("  Gradient clipping: {clip}"));
    }
    lines.join("\n")
}

/// Format output locations
pub fn format_output_info(spec: &PretrainSpec) -> String {
    [
        format!("  Epochs: {}", spec.training.epochs),
        format!("  Output dir: {}", spec.training.output_dir.display()),
        format!(
            "  Checkpoints: {} (keep {})",
            spec.checkpoint_dir().display(),
            spec.checkpoint.keep
        ),
        format!("  Replicas: {}", spec.distributed.world_size),
    ]
    .join("\n")
}

pub fn format_summary(spec: &PretrainSpec) -> String {
    [
        "Configuration Summary:".to_string(),
        format_data_info(spec),
        format_masking_info(spec),
        format_optimization_info(spec),
        format_output_info(spec),
    ]
    .join("\n\n")
}

pub fn run_info(args: InfoArgs, level: LogLevel) -> Result<(), String> {
    let spec = load_spec(&args.config).map_err(|e| format!("Config error: {e}"))?;
    if args.yaml {
        let yaml = serde_yaml::to_string(&spec).map_err(|e| format!("Serialization error: {e}"))?;
        println!("{yaml}");
        return Ok(());
    }
    log(level, LogLevel::Normal, &format_summary(&spec));
    Ok(())
}
