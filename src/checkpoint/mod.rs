//! Checkpoint persistence with a keep-most-recent policy

mod dir;

pub use dir::DirCheckpointer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::autograd::Tensor;
use crate::error::Result;
use crate::train::TrainState;

/// Identifying metadata stored with each checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Monotonic save counter assigned by the checkpointer
    #[serde(default)]
    pub sequence: u64,
    /// Epoch the checkpoint was taken after
    pub epoch: usize,
    /// Optimizer step at save time
    pub step: u64,
    /// Validation accuracy that tagged this checkpoint
    pub valid_accuracy: f32,
    pub saved_at: DateTime<Utc>,
}

/// Full resumable training state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub meta: CheckpointMeta,
    pub train_state: TrainState,
    pub params: Vec<Tensor>,
    #[serde(default)]
    pub optimizer_state: serde_json::Value,
    /// Loss scale at save time
    pub loss_scale: f32,
}

/// Persists checkpoints, pruning all but the most recent ones
pub trait Checkpointer: Send {
    /// Save `checkpoint`, then delete older ones so only `keep` remain
    fn save_and_keep_only(&mut self, checkpoint: &Checkpoint, keep: usize) -> Result<()>;

    /// Metadata of stored checkpoints, oldest first
    fn list(&self) -> Result<Vec<CheckpointMeta>>;

    /// Most recently saved checkpoint
    fn load_latest(&self) -> Result<Option<Checkpoint>>;
}
