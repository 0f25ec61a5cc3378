//! Duration-bucketed dynamic batching

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Order in which finished batches are yielded each epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOrdering {
    /// Shuffle batches with the epoch seed
    #[default]
    Random,
    /// Shortest batches first
    Ascending,
    /// Longest batches first
    Descending,
}

/// Groups samples into batches whose total duration fits a time budget
///
/// Durations are split into `num_buckets` buckets at empirical quantiles.
/// A bucket with upper boundary `b` holds at most `floor(budget / b)`
/// samples, so every batch's total duration stays within the budget (a
/// single sample longer than the budget forms a batch of its own).
#[derive(Debug, Clone)]
pub struct DynamicBatchSampler {
    durations: Vec<f64>,
    boundaries: Vec<f64>,
    capacities: Vec<usize>,
    max_batch_seconds: f64,
    ordering: BatchOrdering,
    shuffle: bool,
    seed: u64,
}

impl DynamicBatchSampler {
    /// Create a sampler over per-sample durations (seconds)
    pub fn new(
        durations: Vec<f64>,
        max_batch_seconds: f64,
        num_buckets: usize,
        seed: u64,
    ) -> Result<Self> {
        if !(max_batch_seconds > 0.0) {
            return Err(Error::Config(format!(
                "seconds_per_batch must be > 0, got {max_batch_seconds}"
            )));
        }
        if num_buckets == 0 {
            return Err(Error::Config("num_buckets must be >= 1".into()));
        }
        if durations.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(Error::Config("sample durations must be finite and non-negative".into()));
        }

        let boundaries = quantile_boundaries(&durations, num_buckets);
        let capacities = boundaries
            .iter()
            .map(|&b| {
                if b > 0.0 {
                    ((max_batch_seconds / b).floor() as usize).max(1)
                } else {
                    usize::MAX
                }
            })
            .collect();

        Ok(Self {
            durations,
            boundaries,
            capacities,
            max_batch_seconds,
            ordering: BatchOrdering::Random,
            shuffle: true,
            seed,
        })
    }

    /// Set how batches are ordered each epoch
    pub fn with_ordering(mut self, ordering: BatchOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Whether samples are shuffled before bucketing
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Upper duration boundary of each bucket
    pub fn bucket_boundaries(&self) -> &[f64] {
        &self.boundaries
    }

    /// Per-batch time budget in seconds
    pub fn max_batch_seconds(&self) -> f64 {
        self.max_batch_seconds
    }

    /// Number of samples being batched
    pub fn num_samples(&self) -> usize {
        self.durations.len()
    }

    fn bucket_of(&self, duration: f64) -> usize {
        self.boundaries
            .iter()
            .position(|&b| duration <= b)
            .unwrap_or(self.boundaries.len().saturating_sub(1))
    }

    /// Batches of sample indices for `epoch`, deterministic given the seed
    pub fn batches(&self, epoch: u64) -> Vec<Vec<usize>> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
        let mut order: Vec<usize> = (0..self.durations.len()).collect();
        if self.shuffle {
            order.shuffle(&mut rng);
        }

        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); self.boundaries.len()];
        let mut batches = Vec::new();
        for idx in order {
            let b = self.bucket_of(self.durations[idx]);
            buckets[b].push(idx);
            if buckets[b].len() >= self.capacities[b] {
                batches.push(std::mem::take(&mut buckets[b]));
            }
        }
        batches.extend(buckets.into_iter().filter(|b| !b.is_empty()));

        match self.ordering {
            BatchOrdering::Random => batches.shuffle(&mut rng),
            BatchOrdering::Ascending => {
                batches.sort_by(|a, b| self.max_duration(a).total_cmp(&self.max_duration(b)))
            }
            BatchOrdering::Descending => {
                batches.sort_by(|a, b| self.max_duration(b).total_cmp(&self.max_duration(a)))
            }
        }
        batches
    }

    /// Sum of durations in a batch
    pub fn batch_seconds(&self, batch: &[usize]) -> f64 {
        batch.iter().map(|&i| self.durations[i]).sum()
    }

    fn max_duration(&self, batch: &[usize]) -> f64 {
        batch.iter().map(|&i| self.durations[i]).fold(0.0, f64::max)
    }
}

/// Bucket upper boundaries at the empirical duration quantiles
fn quantile_boundaries(durations: &[f64], num_buckets: usize) -> Vec<f64> {
    if durations.is_empty() {
        return vec![0.0];
    }
    let mut sorted = durations.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let mut boundaries: Vec<f64> = (1..=num_buckets)
        .map(|q| {
            let rank = (q * n).div_ceil(num_buckets);
            sorted[rank.clamp(1, n) - 1]
        })
        .collect();
    boundaries.dedup();
    boundaries
}

/// Batches assigned to one data-parallel replica
///
/// The batch list is padded by repeating its head until its length is a
/// multiple of `world_size`, then strided by rank, so every replica sees the
/// same number of batches.
pub fn partition_for_replica(
    batches: &[Vec<usize>],
    rank: usize,
    world_size: usize,
) -> Result<Vec<Vec<usize>>> {
    if world_size == 0 || rank >= world_size {
        return Err(Error::Config(format!(
            "invalid replica rank {rank} for world size {world_size}"
        )));
    }
    if batches.is_empty() {
        return Ok(Vec::new());
    }
    let padded_len = batches.len().div_ceil(world_size) * world_size;
    Ok(batches
        .iter()
        .cycle()
        .take(padded_len)
        .skip(rank)
        .step_by(world_size)
        .cloned()
        .collect())
}
