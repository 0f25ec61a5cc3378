//! Data-parallel gradient synchronization
//!
//! Replicas exchange gradients only at accumulation boundaries. A
//! [`GradientSync`] averages the flattened gradient buffers across replicas
//! and checks that every replica arrived at the same optimizer step; any
//! disagreement is a fatal [`Error::DistributedDesync`](crate::Error).

mod local;
mod thread_group;

pub use local::LocalSync;
pub use thread_group::{ThreadGroup, ThreadReplica};

use crate::autograd::Tensor;
use crate::error::Result;

/// Collective operations a replica takes part in
pub trait GradientSync: Send {
    /// This replica's rank in `0..world_size`
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Whether this replica owns checkpoint writes and tracking
    fn is_main(&self) -> bool {
        self.rank() == 0
    }

    /// Average gradients across replicas, all of which must be at `step`
    fn all_reduce_grads(&mut self, params: &mut [Tensor], step: u64) -> Result<()>;

    /// True on every replica iff `local` is true on every replica at `step`
    fn all_agree(&mut self, local: bool, step: u64) -> Result<bool>;

    /// Block until every replica reaches the barrier
    fn barrier(&mut self) -> Result<()>;
}

/// Run `f` on the main replica only, then wait for all replicas
///
/// Returns `Some` with `f`'s result on the main replica and `None` elsewhere.
pub fn run_on_main<S, T, F>(sync: &mut S, f: F) -> Result<Option<T>>
where
    S: GradientSync + ?Sized,
    F: FnOnce() -> Result<T>,
{
    let out = if sync.is_main() { Some(f()?) } else { None };
    sync.barrier()?;
    Ok(out)
}

/// Concatenate gradients of all parameters (zeros where absent)
pub(crate) fn flatten_grads(params: &[Tensor]) -> Vec<f32> {
    let total: usize = params.iter().map(Tensor::len).sum();
    let mut flat = Vec::with_capacity(total);
    for param in params {
        match param.grad() {
            Some(grad) => flat.extend(grad.iter().copied()),
            None => flat.extend(std::iter::repeat_n(0.0, param.len())),
        }
    }
    flat
}

/// Write a flat buffer from [`flatten_grads`] back into the gradients
pub(crate) fn unflatten_grads(params: &mut [Tensor], flat: &[f32]) {
    let mut offset = 0;
    for param in params {
        let len = param.len();
        let chunk = ndarray::Array1::from(flat[offset..offset + len].to_vec());
        param.set_grad(chunk);
        offset += len;
    }
}
