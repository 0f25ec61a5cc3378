//! The training-step engine
//!
//! [`Pretrainer`] walks each micro-batch through the state machine
//! `IDLE -> ACCUMULATING -> STEPPING -> IDLE`:
//!
//! - forward through the model stages and the contrastive objective
//! - scaled backward, divided by the accumulation factor
//! - on the last micro-batch of a window: gradient sync, unscale,
//!   finiteness check, optional clipping, optimizer step, zeroed
//!   gradients, and schedule updates keyed by the new step

mod config;
mod core;
mod epoch;
mod result;
mod step;

#[cfg(test)]
mod tests;

pub use config::PretrainConfig;
pub use core::Pretrainer;
pub use result::{EpochSummary, PretrainResult};
pub use step::StepOutcome;
