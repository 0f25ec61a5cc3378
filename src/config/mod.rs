//! YAML training specs, validation and command-line types

mod builder;
mod cli;
mod schema;
mod train;
mod validate;

pub use builder::{
    build_collator, build_model, build_objective, build_optimizer, build_pretrain_config,
    build_sampler, load_spec, parse_spec, valid_batches,
};
pub use cli::{
    apply_overrides, parse_args, Cli, Command, InfoArgs, PlanArgs, TrainArgs, ValidateArgs,
};
pub use schema::{
    CheckpointSpec, DataSpec, DistributedSpec, MaskingSpec, ModelSpec, ObjectiveSpec,
    OptimizerSpec, PretrainSpec, TrackingSpec, TrainingSpec,
};
pub use train::{train_from_spec, train_from_yaml};
pub use validate::{validate_spec, ValidationError};
