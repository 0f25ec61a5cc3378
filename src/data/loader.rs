//! Prefetching batch loader

use std::collections::BTreeMap;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::collate::{Collator, MaskedBatch};
use super::source::AudioSource;
use crate::error::{Error, Result};

/// Worker pool settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Collation threads; 0 collates on the calling thread
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Bounded queue depth between workers and the consumer
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

fn default_num_workers() -> usize {
    2
}

fn default_prefetch() -> usize {
    4
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { num_workers: default_num_workers(), prefetch: default_prefetch() }
    }
}

/// RNG for one batch's mask, independent of which worker collates it
pub fn batch_rng(seed: u64, batch_index: usize) -> StdRng {
    // splitmix-style mixing keeps adjacent batch seeds decorrelated
    let mixed = seed ^ (batch_index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    StdRng::seed_from_u64(mixed)
}

fn load_batch(
    source: &dyn AudioSource,
    collator: &Collator,
    indices: &[usize],
    seed: u64,
    batch_index: usize,
) -> Result<MaskedBatch> {
    let samples = indices.iter().map(|&i| source.load(i)).collect::<Result<Vec<_>>>()?;
    let mut rng = batch_rng(seed, batch_index);
    collator.collate(&samples, &mut rng)
}

enum Mode {
    Inline { source: Arc<dyn AudioSource>, collator: Arc<Collator> },
    Workers { rx: Option<Receiver<(usize, Result<MaskedBatch>)>>, handles: Vec<JoinHandle<()>> },
}

/// Yields collated batches in sampler order
///
/// Workers take batches round-robin and push them through a bounded channel;
/// out-of-order arrivals are held until their turn so the consumer always
/// sees the planned order regardless of worker timing.
pub struct PrefetchLoader {
    batches: Arc<Vec<Vec<usize>>>,
    seed: u64,
    next_index: usize,
    pending: BTreeMap<usize, Result<MaskedBatch>>,
    mode: Mode,
}

impl PrefetchLoader {
    pub fn new(
        source: Arc<dyn AudioSource>,
        collator: Arc<Collator>,
        batches: Vec<Vec<usize>>,
        seed: u64,
        config: LoaderConfig,
    ) -> Self {
        let batches = Arc::new(batches);
        let num_workers = config.num_workers.min(batches.len());
        let mode = if num_workers == 0 {
            Mode::Inline { source, collator }
        } else {
            let (tx, rx) = sync_channel(config.prefetch.max(1));
            let handles = (0..num_workers)
                .map(|worker| {
                    let tx = tx.clone();
                    let source = Arc::clone(&source);
                    let collator = Arc::clone(&collator);
                    let batches = Arc::clone(&batches);
                    std::thread::spawn(move || {
                        for idx in (worker..batches.len()).step_by(num_workers) {
                            let batch =
                                load_batch(source.as_ref(), &collator, &batches[idx], seed, idx);
                            if tx.send((idx, batch)).is_err() {
                                // Consumer hung up
                                return;
                            }
                        }
                    })
                })
                .collect();
            Mode::Workers { rx: Some(rx), handles }
        };

        tracing::debug!(batches = batches.len(), workers = num_workers, "Started batch loader");

        Self { batches, seed, next_index: 0, pending: BTreeMap::new(), mode }
    }

    /// Total number of batches this loader yields
    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }
}

impl Iterator for PrefetchLoader {
    type Item = Result<MaskedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.batches.len() {
            return None;
        }
        let idx = self.next_index;
        self.next_index += 1;

        match &mut self.mode {
            Mode::Inline { source, collator } => {
                Some(load_batch(source.as_ref(), collator, &self.batches[idx], self.seed, idx))
            }
            Mode::Workers { rx, .. } => {
                let rx = rx.as_ref()?;
                loop {
                    if let Some(batch) = self.pending.remove(&idx) {
                        return Some(batch);
                    }
                    match rx.recv() {
                        Ok((i, batch)) => {
                            self.pending.insert(i, batch);
                        }
                        Err(_) => {
                            return Some(Err(Error::Audio(format!(
                                "loader workers exited before batch {idx}"
                            ))))
                        }
                    }
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.batches.len() - self.next_index;
        (remaining, Some(remaining))
    }
}

impl Drop for PrefetchLoader {
    fn drop(&mut self) {
        if let Mode::Workers { rx, handles } = &mut self.mode {
            // Dropping the receiver unblocks workers waiting on a full queue
            drop(rx.take());
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}
