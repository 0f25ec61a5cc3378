//! Experiment tracking
//!
//! Trackers receive flat key-value metric records tagged with the optimizer
//! step, plus the run's hyperparameters once at start. Only the main replica
//! forwards records to a tracker.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use w2v_pretrain::tracking::{ExperimentTracker, InMemoryTracker};
//!
//! # fn main() -> w2v_pretrain::Result<()> {
//! let mut tracker = InMemoryTracker::new();
//! let mut record = BTreeMap::new();
//! record.insert("loss".to_string(), 2.5);
//! tracker.log_metrics(&record, 100)?;
//!
//! assert_eq!(tracker.values("loss"), vec![(100, 2.5)]);
//! # Ok(())
//! # }
//! ```

pub mod storage;

pub use storage::{InMemoryTracker, JsonlTracker, MetricRecord};

use std::collections::BTreeMap;

use crate::error::Result;

/// Sink for training metrics
pub trait ExperimentTracker: Send {
    /// Record hyperparameters for the run
    fn log_params(&mut self, _params: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }

    /// Record metric values at optimizer step `step`
    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: u64) -> Result<()>;

    /// Flush buffered records
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
