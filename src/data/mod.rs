//! Data pipeline: audio sources, masking, dynamic batching and prefetch
//!
//! Samples flow through the pipeline as follows:
//!
//! 1. An [`AudioSource`] yields normalized waveforms with their durations
//! 2. [`DynamicBatchSampler`] groups sample indices into duration-bucketed
//!    batches under a seconds-per-batch budget
//! 3. [`partition_for_replica`] splits those batches across data-parallel
//!    replicas
//! 4. [`Collator`] pads the waveforms, derives latent lengths from the
//!    downsampling stack and draws the equalized [`MaskGenerator`] mask
//! 5. [`PrefetchLoader`] runs collation on worker threads behind a bounded
//!    queue

mod collate;
mod latent;
mod loader;
mod mask;
mod sampler;
mod source;
pub mod wav;

pub use collate::{Collator, MaskedBatch};
pub use latent::{latent_length, latent_lengths, min_input_length, DownsamplingStack};
pub use loader::{batch_rng, LoaderConfig, PrefetchLoader};
pub use mask::{equalize_mask_rows, MaskGenerator};
pub use sampler::{partition_for_replica, BatchOrdering, DynamicBatchSampler};
pub use source::{
    normalize_signal, AudioSource, DurationFilter, InMemorySource, ManifestEntry, ManifestSource,
    Sample,
};
