//! Validate command implementation

use crate::cli::logging::log;
use crate::cli::LogLevel;
use crate::config::{load_spec, validate_spec, ValidateArgs};

pub fn run_validate(args: ValidateArgs, level: LogLevel) -> Result<(), String> {
    log(level, LogLevel::Normal, &format!("Validating config: {}", args.config.display()));

    let spec = load_spec(&args.config).map_err(|e| format!("Config error: {e}"))?;
    if args.check_paths {
        validate_spec(&spec, true).map_err(|e| format!("Config error: {e}"))?;
    }

    log(level, LogLevel::Normal, "✓ Configuration is valid");
    if level == LogLevel::Verbose {
        println!();
        println!("{}", super::info::format_summary(&spec));
    }
    Ok(())
}
