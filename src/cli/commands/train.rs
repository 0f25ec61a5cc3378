//! Train command implementation

use crate::cli::logging::log;
use crate::cli::LogLevel;
use crate::config::{apply_overrides, load_spec, train_from_spec, validate_spec, TrainArgs};

pub fn run_train(args: TrainArgs, level: LogLevel) -> Result<(), String> {
    log(level, LogLevel::Normal, &format!("w2v-pretrain: training from {}", args.config.display()));

    let mut spec = load_spec(&args.config).map_err(|e| format!("Config error: {e}"))?;
    apply_overrides(&mut spec, &args);
    validate_spec(&spec, true).map_err(|e| format!("Config error: {e}"))?;

    if args.dry_run {
        log(level, LogLevel::Normal, "Dry run - config validated successfully");
        log(
            level,
            LogLevel::Verbose,
            &format!("  Train manifest: {}", spec.data.train_manifest.display()),
        );
        log(level, LogLevel::Verbose, &format!("  Epochs: {}", spec.training.epochs));
        log(
            level,
            LogLevel::Verbose,
            &format!("  Accumulation factor: {}", spec.training.accumulation_factor),
        );
        log(level, LogLevel::Verbose, &format!("  Replicas: {}", spec.distributed.world_size));
        return Ok(());
    }

    let result = train_from_spec(&spec).map_err(|e| format!("Training error: {e}"))?;

    log(level, LogLevel::Normal, "Training complete!");
    log(
        level,
        LogLevel::Normal,
        &format!("  Steps: {} ({} skipped)", result.steps, result.skipped_steps),
    );
    if let Some(best) = result.best_valid_accuracy() {
        log(level, LogLevel::Normal, &format!("  Best validation accuracy: {best:.4}"));
    }
    Ok(())
}
