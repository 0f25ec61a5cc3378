//! Replica-local training state and step log records

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::forward::Objectives;

const AVG_DECAY: f64 = 0.99;

/// Mutable state of the step driver, persisted in checkpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    /// Optimizer steps taken, including skipped ones
    pub step: u64,
    /// Micro-batches seen; carries across epochs
    pub micro_step: u64,
    /// Completed epochs
    pub epoch: usize,
    /// Exponential moving average of the training loss
    pub avg_train_loss: Option<f64>,
    /// Wall-clock time of the previous step log
    pub last_log: Option<DateTime<Utc>>,
    /// Consecutive steps skipped for non-finite gradients
    pub consecutive_skipped: u32,
    /// Total steps skipped for non-finite gradients
    pub total_skipped: u64,
}

impl TrainState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `loss` into the running average and return the new value
    ///
    /// The first value seeds the average; later values decay it by 0.99.
    pub fn update_average(&mut self, loss: f64) -> f64 {
        let avg = match self.avg_train_loss {
            None => loss,
            Some(prev) => AVG_DECAY * prev + (1.0 - AVG_DECAY) * loss,
        };
        self.avg_train_loss = Some(avg);
        avg
    }

    /// Seconds since the previous log, then stamp `now` as the latest log
    pub fn mark_log(&mut self, now: DateTime<Utc>) -> Option<f64> {
        let elapsed = self
            .last_log
            .map(|prev| (now - prev).num_milliseconds() as f64 / 1000.0);
        self.last_log = Some(now);
        elapsed
    }
}

/// One periodic training log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub step: u64,
    pub loss: f32,
    pub total_loss: f32,
    pub accuracy: f32,
    pub num_masked: usize,
    pub ratio_masked: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diversity_loss: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_perplexity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prob_perplexity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_vars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub lr: f32,
    pub avg_loss: Option<f64>,
    /// Seconds since the previous log record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_time: Option<f64>,
}

impl StepLog {
    pub fn new(
        step: u64,
        objectives: &Objectives,
        lr: f32,
        avg_loss: Option<f64>,
        run_time: Option<f64>,
    ) -> Self {
        let q = objectives.quantizer;
        Self {
            step,
            loss: objectives.loss,
            total_loss: objectives.total_loss,
            accuracy: objectives.accuracy,
            num_masked: objectives.num_masked,
            ratio_masked: objectives.ratio_masked,
            diversity_loss: q.map(|s| s.diversity_loss),
            code_perplexity: q.map(|s| s.code_perplexity),
            prob_perplexity: q.map(|s| s.prob_perplexity),
            num_vars: q.map(|s| s.num_vars),
            temperature: q.map(|s| s.temperature),
            lr,
            avg_loss,
            run_time,
        }
    }

    /// Flat key-value view for experiment trackers
    pub fn to_record(&self) -> BTreeMap<String, f64> {
        let mut record = BTreeMap::new();
        record.insert("loss".to_string(), f64::from(self.loss));
        record.insert("total_loss".to_string(), f64::from(self.total_loss));
        record.insert("accuracy".to_string(), f64::from(self.accuracy));
        record.insert("num_masked".to_string(), self.num_masked as f64);
        record.insert("ratio_masked".to_string(), f64::from(self.ratio_masked));
        record.insert("lr".to_string(), f64::from(self.lr));
        let optional = [
            ("diversity_loss", self.diversity_loss.map(f64::from)),
            ("code_perplex", self.code_perplexity.map(f64::from)),
            ("prob_perplex", self.prob_perplexity.map(f64::from)),
            ("num_vars", self.num_vars.map(|v| v as f64)),
            ("temp", self.temperature.map(f64::from)),
            ("avg_loss", self.avg_loss),
            ("stats/run_time", self.run_time),
        ];
        for (key, value) in optional {
            if let Some(v) = value {
                record.insert(key.to_string(), v);
            }
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn objectives() -> Objectives {
        Objectives {
            loss: 2.0,
            total_loss: 2.5,
            accuracy: 0.25,
            num_masked: 40,
            ratio_masked: 0.4,
            quantizer: None,
        }
    }

    #[test]
    fn test_running_average() {
        let mut state = TrainState::new();
        assert_eq!(state.update_average(3.0), 3.0);
        let second = state.update_average(1.0);
        assert_relative_eq!(second, 0.99 * 3.0 + 0.01 * 1.0);
        assert_eq!(state.avg_train_loss, Some(second));
    }

    #[test]
    fn test_mark_log_elapsed() {
        let mut state = TrainState::new();
        let t0 = Utc::now();
        assert_eq!(state.mark_log(t0), None);
        let elapsed = state.mark_log(t0 + Duration::milliseconds(2500));
        assert_eq!(elapsed, Some(2.5));
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = TrainState::new();
        state.step = 12;
        state.micro_step = 48;
        state.update_average(0.7);
        state.mark_log(Utc::now());
        let json = serde_json::to_string(&state).unwrap();
        let back: TrainState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_record_omits_absent_quantizer_fields() {
        let log = StepLog::new(100, &objectives(), 1e-4, Some(2.1), None);
        let record = log.to_record();
        assert_eq!(record["loss"], 2.0);
        assert_eq!(record["num_masked"], 40.0);
        assert!(!record.contains_key("diversity_loss"));
        assert!(!record.contains_key("stats/run_time"));
        assert_eq!(record["avg_loss"], 2.1);
    }
}
