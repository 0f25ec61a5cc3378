//! Single-replica synchronization

use super::GradientSync;
use crate::autograd::Tensor;
use crate::error::Result;

/// The only replica; collectives are no-ops
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSync;

impl GradientSync for LocalSync {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_grads(&mut self, _params: &mut [Tensor], _step: u64) -> Result<()> {
        Ok(())
    }

    fn all_agree(&mut self, local: bool, _step: u64) -> Result<bool> {
        Ok(local)
    }

    fn barrier(&mut self) -> Result<()> {
        Ok(())
    }
}
