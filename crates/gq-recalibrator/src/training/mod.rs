//! Recalibrator training: loss, gradient clipping, loss bookkeeping,
//! checkpointed state and the mini-epoch training loop.

pub mod checkpoint;
pub mod clipping;
pub mod config;
pub mod loss;
pub mod metrics;
pub mod progress;
pub mod state;
pub mod trainer;
