//! Masked contrastive pretraining
//!
//! - [`stages`]: contracts for the model stages and the contrastive objective
//! - [`forward`]: masked gathers and the composite loss
//! - [`negatives`]: distractor sampling over masked targets
//! - [`state`]: step counters, running loss average and log records
//! - [`Pretrainer`]: the accumulation / update state machine

pub mod forward;
pub mod negatives;
mod pretrainer;
pub mod stages;
pub mod state;

pub use forward::{composite_loss, gather_masked, scatter_masked, ForwardResult, Objectives};
pub use negatives::{gather_negatives, scatter_negative_grads, NegativeIndices, NegativeSampler};
pub use pretrainer::{EpochSummary, PretrainConfig, PretrainResult, Pretrainer, StepOutcome};
pub use stages::{
    BackwardSignal, ContrastiveObjective, EncoderOutput, ObjectiveOutput, PretrainModel,
    QuantizerOutput, QuantizerStats,
};
pub use state::{StepLog, TrainState};
