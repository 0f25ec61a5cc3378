//! AdamW optimizer (Adam with decoupled weight decay)

use super::Optimizer;
use crate::autograd::Tensor;
use crate::error::{Error, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// AdamW optimizer
///
/// θ_t = (1 - lr * λ) * θ_{t-1} - lr_t * m_t / (√v_t + ε), with bias
/// correction folded into lr_t.
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    state: AdamWState,
}

/// Moment buffers and step counter, persisted with checkpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AdamWState {
    t: u64,
    m: Vec<Option<Array1<f32>>>,
    v: Vec<Option<Array1<f32>>>,
}

impl AdamW {
    /// Create a new AdamW optimizer
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self { lr, beta1, beta2, epsilon, weight_decay, state: AdamWState::default() }
    }

    /// AdamW with the betas used for wav2vec2 pretraining (0.9, 0.98)
    pub fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.98, 1e-6, 0.01)
    }

    /// Number of updates applied so far
    pub fn step_count(&self) -> u64 {
        self.state.t
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [Tensor]) {
        let state = &mut self.state;
        if state.m.len() < params.len() {
            state.m.resize(params.len(), None);
            state.v.resize(params.len(), None);
        }
        state.t += 1;

        let t = state.t as i32;
        let lr_t = self.lr * ((1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t)));
        let decay = 1.0 - self.lr * self.weight_decay;

        for (i, param) in params.iter_mut().enumerate() {
            if !param.requires_grad() {
                continue;
            }
            let Some(grad) = param.grad() else {
                continue;
            };

            let m_t = match &state.m[i] {
                Some(m) => m * self.beta1 + grad * (1.0 - self.beta1),
                None => grad * (1.0 - self.beta1),
            };
            let grad_sq = grad * grad;
            let v_t = match &state.v[i] {
                Some(v) => v * self.beta2 + &grad_sq * (1.0 - self.beta2),
                None => &grad_sq * (1.0 - self.beta2),
            };

            let update = &m_t / &(v_t.mapv(f32::sqrt) + self.epsilon) * lr_t;
            let data = param.data_mut();
            data.mapv_inplace(|x| x * decay);
            *data -= &update;

            state.m[i] = Some(m_t);
            state.v[i] = Some(v_t);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn state(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or(serde_json::Value::Null)
    }

    fn load_state(&mut self, state: &serde_json::Value) -> Result<()> {
        if state.is_null() {
            return Ok(());
        }
        self.state = serde_json::from_value(state.clone())
            .map_err(|e| Error::Checkpoint(format!("invalid AdamW state: {e}")))?;
        Ok(())
    }
}
