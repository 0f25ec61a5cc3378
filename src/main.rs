//! w2v-pretrain CLI
//!
//! Masked contrastive pretraining driven by a YAML config.
//!
//! # Usage
//!
//! ```bash
//! # Train from config
//! w2v-pretrain train hparams.yaml
//!
//! # Train with overrides
//! w2v-pretrain train hparams.yaml --epochs 10 --accumulation 4
//!
//! # Validate config, including manifest paths
//! w2v-pretrain validate hparams.yaml --check-paths
//!
//! # Show config info
//! w2v-pretrain info hparams.yaml
//!
//! # Print the batch plan one replica sees in an epoch
//! w2v-pretrain plan hparams.yaml --epoch 3 --rank 1
//! ```

use clap::Parser;
use std::process::ExitCode;
use w2v_pretrain::cli::{init_tracing, run_command, Cli, LogLevel};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(LogLevel::from_flags(cli.quiet, cli.verbose));

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
