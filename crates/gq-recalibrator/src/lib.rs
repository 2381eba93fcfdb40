//! Neural recalibration of structural-variant genotype quality (GQ).
//!
//! An MLP maps each genotype's scaled property vector to the probability
//! that the call is good. Training minimizes disagreement with partial truth
//! labels while keeping predictions correlated with the original GQ, and
//! checkpoints the complete run state so training can resume.

pub mod model;
pub mod training;

pub use model::bridge::BatchTensors;
pub use model::recalibrator::{GqRecalibratorConfig, GqRecalibratorNet, Nonlinearity};
pub use training::checkpoint::{
    open_checkpoint, read_checkpoint, write_checkpoint, CheckpointError, CheckpointRecord,
};
pub use training::config::{DeviceKind, TrainingConfig};
pub use training::metrics::{BatchLosses, LossHistory, LossSeries, Phase, StepLosses};
pub use training::state::{init_optimizer, TrainingInputs, TrainingState};
pub use training::trainer::{train, BatchReport, StopReason, TrainingOutcome};
