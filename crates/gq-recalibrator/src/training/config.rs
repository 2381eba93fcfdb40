use std::fmt;
use std::str::FromStr;

use burn::optim::AdamWConfig;
use burn::prelude::*;

use crate::training::clipping::GradientClipper;

/// Optimization and scheduling hyperparameters for a training run.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Training batches between loss summaries and checkpoints.
    #[config(default = 50)]
    pub batches_per_mini_epoch: usize,
    /// Stop once this many variants have been trained on in the current run.
    #[config(default = "None")]
    pub max_train_variants: Option<u64>,
    /// AdamW learning rate.
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// AdamW decoupled weight decay.
    #[config(default = 0.0)]
    pub weight_decay: f64,
    /// Element-wise gradient clamp, applied first.
    #[config(default = "Some(1e-2)")]
    pub max_gradient_value: Option<f64>,
    /// Global L2 gradient-norm bound, applied after the value clamp.
    #[config(default = "Some(1e-2)")]
    pub max_gradient_norm: Option<f64>,
    /// Weight of `1 - gq_correlation` in the combined loss.
    #[config(default = 0.5)]
    pub correlation_loss_weight: f64,
}

impl TrainingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.batches_per_mini_epoch > 0,
            "batches_per_mini_epoch must be positive"
        );
        anyhow::ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learning_rate must be positive, got {}",
            self.learning_rate
        );
        anyhow::ensure!(
            self.weight_decay.is_finite() && self.weight_decay >= 0.0,
            "weight_decay must be non-negative, got {}",
            self.weight_decay
        );
        for (name, bound) in [
            ("max_gradient_value", self.max_gradient_value),
            ("max_gradient_norm", self.max_gradient_norm),
        ] {
            if let Some(b) = bound {
                anyhow::ensure!(b.is_finite() && b > 0.0, "{name} must be positive, got {b}");
            }
        }
        anyhow::ensure!(
            self.correlation_loss_weight.is_finite() && self.correlation_loss_weight >= 0.0,
            "correlation_loss_weight must be non-negative"
        );
        Ok(())
    }

    /// AdamW without built-in clipping; clipping is done by [`GradientClipper`].
    pub fn optimizer_config(&self) -> AdamWConfig {
        AdamWConfig::new().with_weight_decay(self.weight_decay as f32)
    }

    pub fn clipper(&self) -> GradientClipper {
        GradientClipper::new(self.max_gradient_value, self.max_gradient_norm)
    }
}

/// Compute device for training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// NdArray backend.
    #[default]
    Cpu,
    /// WGPU backend, only with the `wgpu` feature.
    Wgpu,
}

impl DeviceKind {
    /// Whether this build can run on the device.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Cpu => true,
            Self::Wgpu => cfg!(feature = "wgpu"),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Wgpu => "wgpu",
        })
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "wgpu" | "gpu" => Ok(Self::Wgpu),
            other => Err(format!("unknown device: {other} (expected cpu or wgpu)")),
        }
    }
}
