//! Core Pretrainer struct and accessors

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::config::PretrainConfig;
use crate::autograd::{GradScaler, Tensor};
use crate::checkpoint::{Checkpoint, CheckpointMeta, Checkpointer};
use crate::distributed::{GradientSync, LocalSync};
use crate::error::{Error, Result};
use crate::optim::{gumbel_temperature, Optimizer};
use crate::tracking::ExperimentTracker;
use crate::train::forward::Objectives;
use crate::train::negatives::NegativeSampler;
use crate::train::stages::{ContrastiveObjective, PretrainModel};
use crate::train::state::TrainState;

/// Seed of the validation negatives; identical on every replica and pass
pub(crate) fn eval_seed(seed: u64) -> u64 {
    seed ^ 0x5EED_0F_E7A1
}

/// Micro-batch results gathered over one accumulation window
#[derive(Debug, Clone, Default)]
pub(crate) struct Window {
    pub loss_sum: f64,
    pub count: usize,
    pub all_finite: bool,
    pub last: Option<Objectives>,
}

impl Window {
    pub fn new() -> Self {
        Self { all_finite: true, ..Self::default() }
    }

    pub fn add(&mut self, objectives: Objectives) {
        self.loss_sum += f64::from(objectives.loss);
        self.count += 1;
        self.all_finite &= objectives.total_loss.is_finite();
        self.last = Some(objectives);
    }

    pub fn mean_loss(&self) -> Option<f64> {
        (self.count > 0).then(|| self.loss_sum / self.count as f64)
    }
}

/// Drives masked contrastive pretraining, one micro-batch at a time
///
/// Gradients accumulate over `accumulation_factor` micro-batches. At the
/// end of each window the replicas synchronize, the loss scale is removed,
/// non-finite updates are skipped, and the optimizer steps. Schedules are
/// re-evaluated from the new step counter after every window.
///
/// # Example
///
/// ```no_run
/// use w2v_pretrain::model::{InfoNce, ReferenceModel};
/// use w2v_pretrain::optim::AdamW;
/// use w2v_pretrain::train::{PretrainConfig, Pretrainer};
///
/// # fn main() -> w2v_pretrain::Result<()> {
/// let model = ReferenceModel::new(Default::default(), 7)?;
/// let config = PretrainConfig::new().with_accumulation_factor(4);
/// let mut trainer = Pretrainer::new(
///     Box::new(model),
///     Box::new(InfoNce::default()),
///     Box::new(AdamW::default_params(5e-4)),
///     config,
/// )?;
/// // for batch in loader { trainer.fit_batch(&batch?)?; }
/// # Ok(())
/// # }
/// ```
pub struct Pretrainer {
    pub(crate) model: Box<dyn PretrainModel>,
    pub(crate) objective: Box<dyn ContrastiveObjective>,
    pub(crate) optimizer: Box<dyn Optimizer>,
    pub(crate) negatives: NegativeSampler,
    pub(crate) config: PretrainConfig,
    pub(crate) scaler: GradScaler,
    pub(crate) sync: Box<dyn GradientSync>,
    pub(crate) checkpointer: Option<Box<dyn Checkpointer>>,
    pub(crate) tracker: Option<Box<dyn ExperimentTracker>>,
    pub(crate) state: TrainState,
    pub(crate) window: Window,
    pub(crate) rng: StdRng,
    pub(crate) eval_rng: StdRng,
}

impl Pretrainer {
    /// Create a single-replica engine
    pub fn new(
        model: Box<dyn PretrainModel>,
        objective: Box<dyn ContrastiveObjective>,
        optimizer: Box<dyn Optimizer>,
        config: PretrainConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut trainer = Self {
            model,
            objective,
            optimizer,
            negatives: NegativeSampler::new(config.num_negatives)?,
            scaler: GradScaler::from_config(&config.precision),
            sync: Box::new(LocalSync),
            checkpointer: None,
            tracker: None,
            state: TrainState::new(),
            window: Window::new(),
            rng: StdRng::seed_from_u64(config.seed),
            eval_rng: StdRng::seed_from_u64(eval_seed(config.seed)),
            config,
        };
        trainer.apply_schedules();
        trainer.reseed();
        Ok(trainer)
    }

    /// Join a replica group
    pub fn with_sync(mut self, sync: Box<dyn GradientSync>) -> Self {
        self.sync = sync;
        self.reseed();
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Box<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_tracker(mut self, tracker: Box<dyn ExperimentTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &PretrainConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    /// Optimizer steps taken so far
    pub fn step(&self) -> u64 {
        self.state.step
    }

    pub fn lr(&self) -> f32 {
        self.optimizer.lr()
    }

    pub fn loss_scale(&self) -> f32 {
        self.scaler.scale()
    }

    pub fn model(&self) -> &dyn PretrainModel {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> &mut dyn PretrainModel {
        self.model.as_mut()
    }

    pub fn params(&self) -> &[Tensor] {
        self.model.parameters()
    }

    pub fn is_main(&self) -> bool {
        self.sync.is_main()
    }

    pub fn sync_mut(&mut self) -> &mut dyn GradientSync {
        self.sync.as_mut()
    }

    /// Whether the next micro-batch closes an accumulation window
    pub fn next_is_boundary(&self) -> bool {
        (self.state.micro_step + 1).is_multiple_of(self.config.accumulation_factor as u64)
    }

    /// Set LR and quantizer temperature from the current step
    pub(crate) fn apply_schedules(&mut self) {
        let step = self.state.step;
        if self.model.has_quantizer() {
            let temperature = gumbel_temperature(&self.config.temperature, step);
            self.model.set_quantizer_temperature(temperature);
        }
        self.optimizer.set_lr(self.config.lr_schedule.lr_at(step));
    }

    /// Negative-sampling RNG keyed by seed, rank and step
    fn reseed(&mut self) {
        let rank = self.sync.rank() as u64;
        let seed = self
            .config
            .seed
            .wrapping_add(rank.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .wrapping_add(self.state.step);
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Snapshot of the resumable state
    pub fn checkpoint(&self, epoch: usize, valid_accuracy: f32) -> Checkpoint {
        Checkpoint {
            meta: CheckpointMeta {
                sequence: 0,
                epoch,
                step: self.state.step,
                valid_accuracy,
                saved_at: chrono::Utc::now(),
            },
            train_state: self.state.clone(),
            params: self.model.parameters().to_vec(),
            optimizer_state: self.optimizer.state(),
            loss_scale: self.scaler.scale(),
        }
    }

    /// Resume from a checkpoint produced by [`Pretrainer::checkpoint`]
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let params = self.model.parameters_mut();
        if params.len() != checkpoint.params.len() {
            return Err(Error::Checkpoint(format!(
                "checkpoint has {} parameters, model has {}",
                checkpoint.params.len(),
                params.len()
            )));
        }
        for (param, saved) in params.iter_mut().zip(&checkpoint.params) {
            if param.len() != saved.len() {
                return Err(Error::Checkpoint(format!(
                    "parameter '{}' has {} elements, checkpoint has {}",
                    param.name(),
                    param.len(),
                    saved.len()
                )));
            }
            param.data_mut().assign(saved.data());
            param.zero_grad();
        }
        self.optimizer.load_state(&checkpoint.optimizer_state)?;
        self.scaler.set_scale(checkpoint.loss_scale);
        self.state = checkpoint.train_state.clone();
        // Resume at a window boundary
        self.state.micro_step -= self.state.micro_step % self.config.accumulation_factor as u64;
        self.window = Window::new();
        self.apply_schedules();
        self.reseed();

        tracing::info!(
            step = self.state.step,
            epoch = self.state.epoch,
            sequence = checkpoint.meta.sequence,
            "Restored checkpoint"
        );
        Ok(())
    }

    /// Restore the latest checkpoint, if the checkpointer holds one
    pub fn resume_latest(&mut self) -> Result<bool> {
        let latest = match &self.checkpointer {
            Some(ckpt) => ckpt.load_latest()?,
            None => None,
        };
        match latest {
            Some(checkpoint) => {
                self.restore(&checkpoint)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
