//! Audio sample sources

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use super::wav;
use crate::error::{Error, Result};

const NORM_EPS: f32 = 1e-5;

/// One loaded utterance
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    /// Normalized waveform
    pub waveform: Array1<f32>,
    /// Duration in seconds
    pub duration: f64,
}

impl Sample {
    pub fn len(&self) -> usize {
        self.waveform.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waveform.is_empty()
    }
}

/// Indexed collection of utterances with known durations
///
/// Durations must be available without decoding audio so the batch sampler
/// can plan an epoch up front.
pub trait AudioSource: Send + Sync {
    /// Number of utterances
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Duration of utterance `index` in seconds
    fn duration(&self, index: usize) -> f64;

    /// Identifier of utterance `index`
    fn id(&self, index: usize) -> &str;

    /// Load and normalize utterance `index`
    fn load(&self, index: usize) -> Result<Sample>;

    /// All durations in index order
    fn durations(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.duration(i)).collect()
    }
}

/// Layer-normalize a waveform to zero mean and unit variance
pub fn normalize_signal(signal: ArrayView1<'_, f32>) -> Array1<f32> {
    if signal.is_empty() {
        return Array1::zeros(0);
    }
    let n = signal.len() as f32;
    let mean = signal.sum() / n;
    let var = signal.fold(0.0f32, |acc, &x| acc + (x - mean) * (x - mean)) / n;
    let inv_std = 1.0 / (var + NORM_EPS).sqrt();
    signal.mapv(|x| (x - mean) * inv_std)
}

/// Inclusive duration window applied when loading a manifest
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DurationFilter {
    /// Drop utterances shorter than this many seconds
    #[serde(default)]
    pub min_secs: Option<f64>,
    /// Drop utterances longer than this many seconds
    #[serde(default)]
    pub max_secs: Option<f64>,
}

impl DurationFilter {
    pub fn new(min_secs: Option<f64>, max_secs: Option<f64>) -> Self {
        Self { min_secs, max_secs }
    }

    pub fn accepts(&self, duration: f64) -> bool {
        self.min_secs.is_none_or(|m| duration >= m) && self.max_secs.is_none_or(|m| duration <= m)
    }
}

/// In-memory utterances, mostly for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    samples: Vec<Sample>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw waveform; it is normalized on insertion
    pub fn push(&mut self, id: impl Into<String>, waveform: Array1<f32>, sample_rate_hz: u32) {
        let duration = waveform.len() as f64 / f64::from(sample_rate_hz.max(1));
        self.samples.push(Sample {
            id: id.into(),
            waveform: normalize_signal(waveform.view()),
            duration,
        });
    }

    /// Build from `(id, waveform)` pairs at one sample rate
    pub fn from_waveforms<I, S>(waveforms: I, sample_rate_hz: u32) -> Self
    where
        I: IntoIterator<Item = (S, Vec<f32>)>,
        S: Into<String>,
    {
        let mut source = Self::new();
        for (id, wave) in waveforms {
            source.push(id, Array1::from_vec(wave), sample_rate_hz);
        }
        source
    }
}

impl AudioSource for InMemorySource {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn duration(&self, index: usize) -> f64 {
        self.samples[index].duration
    }

    fn id(&self, index: usize) -> &str {
        &self.samples[index].id
    }

    fn load(&self, index: usize) -> Result<Sample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Audio(format!("sample index {index} out of range")))
    }
}

/// One JSON-lines manifest record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    /// Duration in seconds
    pub duration: f64,
    /// WAV path, relative to the manifest's directory unless absolute
    pub wav: PathBuf,
}

/// Utterances listed in a JSON-lines manifest, sorted by duration
#[derive(Debug, Clone)]
pub struct ManifestSource {
    entries: Vec<ManifestEntry>,
    root: PathBuf,
    sample_rate_hz: u32,
}

impl ManifestSource {
    /// Parse a manifest, drop entries outside `filter`, and sort by duration
    pub fn from_jsonl(
        path: impl AsRef<Path>,
        filter: DurationFilter,
        sample_rate_hz: u32,
    ) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        let mut dropped = 0usize;

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ManifestEntry = serde_json::from_str(&line).map_err(|e| {
                Error::Config(format!(
                    "{}:{}: invalid manifest entry: {e}",
                    path.display(),
                    lineno + 1
                ))
            })?;
            if filter.accepts(entry.duration) {
                entries.push(entry);
            } else {
                dropped += 1;
            }
        }
        entries.sort_by(|a, b| a.duration.total_cmp(&b.duration));

        tracing::info!(
            manifest = %path.display(),
            kept = entries.len(),
            dropped,
            "Loaded manifest"
        );

        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(Self { entries, root, sample_rate_hz })
    }

    /// Manifest records in duration order
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Total audio in seconds
    pub fn total_seconds(&self) -> f64 {
        self.entries.iter().map(|e| e.duration).sum()
    }

    fn resolve(&self, wav: &Path) -> PathBuf {
        if wav.is_absolute() {
            wav.to_path_buf()
        } else {
            self.root.join(wav)
        }
    }
}

impl AudioSource for ManifestSource {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn duration(&self, index: usize) -> f64 {
        self.entries[index].duration
    }

    fn id(&self, index: usize) -> &str {
        &self.entries[index].id
    }

    fn load(&self, index: usize) -> Result<Sample> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| Error::Audio(format!("sample index {index} out of range")))?;
        let decoded = wav::read_wav(self.resolve(&entry.wav))?;
        if decoded.sample_rate_hz != self.sample_rate_hz {
            return Err(Error::Audio(format!(
                "{}: sample rate {} Hz, expected {} Hz",
                entry.id, decoded.sample_rate_hz, self.sample_rate_hz
            )));
        }
        let duration = decoded.duration_secs();
        Ok(Sample {
            id: entry.id.clone(),
            waveform: normalize_signal(ArrayView1::from(&decoded.samples)),
            duration,
        })
    }
}
