//! In-process replica group backed by a shared rendezvous

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::{flatten_grads, unflatten_grads, GradientSync};
use crate::autograd::Tensor;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collective {
    Grads { step: u64 },
    Agree { step: u64 },
    Barrier,
}

type Outcome = std::result::Result<Arc<Vec<f32>>, String>;

#[derive(Debug, Default)]
struct Round {
    generation: u64,
    arrived: usize,
    ops: Vec<Option<Collective>>,
    sum: Vec<f32>,
    len_mismatch: bool,
    outcome: Option<Outcome>,
    departed: usize,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    round: Mutex<Round>,
    cv: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Round>> {
        self.round
            .lock()
            .map_err(|_| Error::DistributedDesync("replica group lock poisoned".into()))
    }
}

/// Factory for a group of in-process replicas
///
/// Each [`ThreadReplica`] is moved to its own thread. Collectives complete
/// once every replica has arrived; a replica that is dropped while others
/// wait makes their pending collective fail.
#[derive(Debug)]
pub struct ThreadGroup;

impl ThreadGroup {
    /// Create `world_size` connected replicas, ranks `0..world_size`
    pub fn new(world_size: usize) -> Result<Vec<ThreadReplica>> {
        if world_size == 0 {
            return Err(Error::Config("world_size must be >= 1".into()));
        }
        let shared = Arc::new(Shared {
            world_size,
            round: Mutex::new(Round { ops: vec![None; world_size], ..Round::default() }),
            cv: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| ThreadReplica { rank, shared: Arc::clone(&shared) })
            .collect())
    }
}

/// One member of a [`ThreadGroup`]
#[derive(Debug)]
pub struct ThreadReplica {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadReplica {
    fn rendezvous(&self, op: Collective, data: &[f32]) -> Result<Arc<Vec<f32>>> {
        let shared = &self.shared;
        let mut round = shared.lock()?;
        if round.departed > 0 {
            return Err(Error::DistributedDesync(format!(
                "rank {} entered {op:?} after a replica left the group",
                self.rank
            )));
        }

        let generation = round.generation;
        if round.arrived == 0 {
            round.sum = vec![0.0; data.len()];
            round.len_mismatch = false;
        }
        if round.sum.len() == data.len() {
            for (acc, &x) in round.sum.iter_mut().zip(data) {
                *acc += x;
            }
        } else {
            round.len_mismatch = true;
        }
        round.ops[self.rank] = Some(op);
        round.arrived += 1;

        if round.arrived == shared.world_size {
            let outcome = Self::resolve(&mut round, shared.world_size);
            round.outcome = Some(outcome);
            round.arrived = 0;
            round.ops.iter_mut().for_each(|o| *o = None);
            round.generation += 1;
            shared.cv.notify_all();
        } else {
            round = shared
                .cv
                .wait_while(round, |r| r.generation == generation && r.departed == 0)
                .map_err(|_| Error::DistributedDesync("replica group lock poisoned".into()))?;
            if round.generation == generation {
                return Err(Error::DistributedDesync(format!(
                    "a replica left the group while rank {} waited in {op:?}",
                    self.rank
                )));
            }
        }

        match &round.outcome {
            Some(Ok(values)) => Ok(Arc::clone(values)),
            Some(Err(reason)) => Err(Error::DistributedDesync(reason.clone())),
            None => Err(Error::DistributedDesync("collective finished without a result".into())),
        }
    }

    fn resolve(round: &mut Round, world_size: usize) -> Outcome {
        let first = round.ops[0];
        if round.ops.iter().any(|op| *op != first) {
            let seen: Vec<String> = round
                .ops
                .iter()
                .enumerate()
                .map(|(rank, op)| format!("rank {rank}: {op:?}"))
                .collect();
            return Err(format!("replicas disagree on collective ({})", seen.join(", ")));
        }
        if round.len_mismatch {
            return Err("replicas contributed buffers of different sizes".into());
        }
        let scale = 1.0 / world_size as f32;
        Ok(Arc::new(round.sum.iter().map(|&x| x * scale).collect()))
    }
}

impl GradientSync for ThreadReplica {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_grads(&mut self, params: &mut [Tensor], step: u64) -> Result<()> {
        let flat = flatten_grads(params);
        let averaged = self.rendezvous(Collective::Grads { step }, &flat)?;
        unflatten_grads(params, &averaged);
        Ok(())
    }

    fn all_agree(&mut self, local: bool, step: u64) -> Result<bool> {
        let dissent = if local { 0.0 } else { 1.0 };
        let mean = self.rendezvous(Collective::Agree { step }, &[dissent])?;
        Ok(mean.first().is_some_and(|&v| v == 0.0))
    }

    fn barrier(&mut self) -> Result<()> {
        self.rendezvous(Collective::Barrier, &[]).map(|_| ())
    }
}

impl Drop for ThreadReplica {
    fn drop(&mut self) {
        if let Ok(mut round) = self.shared.round.lock() {
            round.departed += 1;
            self.shared.cv.notify_all();
        }
    }
}
