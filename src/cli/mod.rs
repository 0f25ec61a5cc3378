//! CLI module
//!
//! Command handlers and output helpers for the `w2v-pretrain` binary.

mod commands;
mod logging;

pub use commands::run_command;
pub use logging::{init_tracing, LogLevel};

// Re-export Cli from config for convenience
pub use crate::config::Cli;
