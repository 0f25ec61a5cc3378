//! CLI argument parsing
//!
//! # Usage
//!
//! ```bash
//! w2v-pretrain train config.yaml
//! w2v-pretrain train config.yaml --epochs 10 --accumulation 4
//! w2v-pretrain validate config.yaml
//! w2v-pretrain info config.yaml
//! w2v-pretrain plan config.yaml --epoch 0
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::schema::PretrainSpec;

/// Masked contrastive pretraining for wav2vec2-style speech models
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "w2v-pretrain")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Pretrain from a YAML configuration
    Train(TrainArgs),

    /// Validate a configuration file without training
    Validate(ValidateArgs),

    /// Display the resolved configuration
    Info(InfoArgs),

    /// Show the batch plan of one epoch
    Plan(PlanArgs),
}

/// Arguments for the train command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct TrainArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Override number of epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Override the random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override the gradient accumulation factor
    #[arg(long)]
    pub accumulation: Option<usize>,

    /// Override the output directory
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Start fresh even if checkpoints exist
    #[arg(long)]
    pub no_resume: bool,

    /// Validate config and data but don't train
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the validate command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ValidateArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Also check that manifest files exist
    #[arg(long)]
    pub check_paths: bool,
}

/// Arguments for the info command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InfoArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Print the resolved spec as YAML
    #[arg(long)]
    pub yaml: bool,
}

/// Arguments for the plan command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct PlanArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Zero-based epoch whose ordering to show
    #[arg(long, default_value_t = 0)]
    pub epoch: u64,

    /// Replica rank to show the partition of
    #[arg(long, default_value_t = 0)]
    pub rank: usize,
}

/// Parse CLI arguments from a string slice (for testing)
pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

/// Apply command-line overrides to a spec
pub fn apply_overrides(spec: &mut PretrainSpec, args: &TrainArgs) {
    if let Some(epochs) = args.epochs {
        spec.training.epochs = epochs;
    }
    if let Some(seed) = args.seed {
        spec.training.seed = seed;
    }
    if let Some(accumulation) = args.accumulation {
        spec.training.accumulation_factor = accumulation;
    }
    if let Some(output_dir) = &args.output_dir {
        spec.training.output_dir = output_dir.clone();
    }
    if args.no_resume {
        spec.checkpoint.resume = false;
    }
}
