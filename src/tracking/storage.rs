//! Tracker backends

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ExperimentTracker;
use crate::error::{Error, Result};

/// A single logged record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step: u64,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
}

/// In-memory tracker for tests
///
/// Clones share the same record buffer, so a handle kept by the caller sees
/// what the engine logs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTracker {
    records: Arc<Mutex<Vec<MetricRecord>>>,
    params: Arc<Mutex<BTreeMap<String, String>>>,
}

impl InMemoryTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records logged so far
    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Hyperparameters logged so far
    pub fn params(&self) -> BTreeMap<String, String> {
        self.params.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// `(step, value)` series for one metric key
    pub fn values(&self, key: &str) -> Vec<(u64, f64)> {
        self.records()
            .into_iter()
            .filter_map(|r| r.metrics.get(key).map(|v| (r.step, *v)))
            .collect()
    }
}

impl ExperimentTracker for InMemoryTracker {
    fn log_params(&mut self, params: &BTreeMap<String, String>) -> Result<()> {
        let mut stored = self
            .params
            .lock()
            .map_err(|_| Error::Tracking("tracker lock poisoned".into()))?;
        stored.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: u64) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| Error::Tracking("tracker lock poisoned".into()))?
            .push(MetricRecord { step, timestamp: Utc::now(), metrics: metrics.clone() });
        Ok(())
    }
}

/// Appends one JSON object per record to `metrics.jsonl`
///
/// Hyperparameters go to `params.json` in the same directory.
#[derive(Debug)]
pub struct JsonlTracker {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlTracker {
    /// Open (appending) the tracker files under `dir`
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;
        Ok(Self { dir, writer: BufWriter::new(file) })
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join("metrics.jsonl")
    }

    /// Read back all records from a metrics file
    pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<MetricRecord>> {
        let content = fs::read_to_string(path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Error::from))
            .collect()
    }
}

impl ExperimentTracker for JsonlTracker {
    fn log_params(&mut self, params: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(params)?;
        fs::write(self.dir.join("params.json"), json)?;
        Ok(())
    }

    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: u64) -> Result<()> {
        let record = MetricRecord { step, timestamp: Utc::now(), metrics: metrics.clone() };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlTracker {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(loss: f64) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("loss".to_string(), loss);
        m.insert("lr".to_string(), 1e-4);
        m
    }

    #[test]
    fn test_in_memory_clones_share_records() {
        let handle = InMemoryTracker::new();
        let mut boxed: Box<dyn ExperimentTracker> = Box::new(handle.clone());
        boxed.log_metrics(&record(2.0), 10).unwrap();
        boxed.log_metrics(&record(1.5), 20).unwrap();
        assert_eq!(handle.values("loss"), vec![(10, 2.0), (20, 1.5)]);
        assert!(handle.values("missing").is_empty());
    }

    #[test]
    fn test_in_memory_params() {
        let mut tracker = InMemoryTracker::new();
        let mut params = BTreeMap::new();
        params.insert("mask_prob".to_string(), "0.65".to_string());
        tracker.log_params(&params).unwrap();
        assert_eq!(tracker.params()["mask_prob"], "0.65");
    }

    #[test]
    fn test_jsonl_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut tracker = JsonlTracker::new(dir.path()).unwrap();
            tracker.log_metrics(&record(3.0), 1).unwrap();
            tracker.log_metrics(&record(2.0), 2).unwrap();
            tracker.flush().unwrap();
            tracker.metrics_path()
        };
        let records = JsonlTracker::read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].step, 2);
        assert_eq!(records[1].metrics["loss"], 2.0);
    }

    #[test]
    fn test_jsonl_appends_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        for step in 0..2 {
            let mut tracker = JsonlTracker::new(dir.path()).unwrap();
            tracker.log_metrics(&record(1.0), step).unwrap();
        }
        let records = JsonlTracker::read_records(dir.path().join("metrics.jsonl")).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_jsonl_params_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = JsonlTracker::new(dir.path()).unwrap();
        let mut params = BTreeMap::new();
        params.insert("seed".to_string(), "1986".to_string());
        tracker.log_params(&params).unwrap();
        let json = fs::read_to_string(dir.path().join("params.json")).unwrap();
        assert!(json.contains("1986"));
    }
}
