//! Training result types

/// Summary of one training epoch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochSummary {
    /// Micro-batches processed, including dropped ones
    pub micro_batches: usize,
    /// Micro-batches that failed and contributed no gradient
    pub dropped: usize,
    /// Optimizer steps completed during the epoch
    pub steps: u64,
    /// Steps skipped for non-finite values
    pub skipped_steps: u64,
    /// Mean contrastive loss over contributing micro-batches
    pub mean_loss: Option<f64>,
}

/// Result of a training run
#[derive(Debug, Clone, PartialEq)]
pub struct PretrainResult {
    /// Epochs completed, counting those of a resumed run
    pub epochs_completed: usize,
    /// Final optimizer step count
    pub steps: u64,
    /// Running average loss at the end of training
    pub avg_train_loss: Option<f64>,
    /// Validation accuracy after each epoch of this run
    pub valid_accuracies: Vec<f32>,
    /// Total steps skipped for non-finite values
    pub skipped_steps: u64,
    pub elapsed_secs: f64,
}

impl PretrainResult {
    /// Highest validation accuracy seen
    pub fn best_valid_accuracy(&self) -> Option<f32> {
        self.valid_accuracies.iter().copied().reduce(f32::max)
    }
}
