//! w2v-pretrain: masked contrastive pretraining for wav2vec2-style models
//!
//! The crate drives self-supervised speech pretraining one micro-batch at a
//! time. Model stages and the contrastive objective are opaque behind the
//! [`train::PretrainModel`] and [`train::ContrastiveObjective`] traits; the
//! crate owns everything around them:
//!
//! - [`data`]: audio sources, dynamic batching, span masking, prefetch
//! - [`train`]: negative sampling, the composite objective and the
//!   accumulation / update engine
//! - [`optim`]: optimizers, clipping and step-keyed schedules
//! - [`distributed`]: gradient synchronization across replicas
//! - [`checkpoint`] and [`tracking`]: persistence on the main replica
//! - [`config`] and [`cli`]: YAML training specs and the command line

pub mod autograd;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod model;
pub mod optim;
pub mod tracking;
pub mod train;

pub use autograd::Tensor;
pub use error::{Error, Result, Stage};
