//! Gradient clipping applied between backward and the optimizer step.
//!
//! Two independent stages, in order: element-wise value clamping, then
//! rescaling every gradient by a shared factor so the global L2 norm does
//! not exceed the bound. burn's own `GradientClippingConfig` clips each
//! parameter separately, so the global norm is computed here.

use burn::module::ParamId;
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::model::recalibrator::GqRecalibratorNet;

const NORM_EPSILON: f64 = 1e-6;

/// Value and global-norm bounds; `None` disables a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GradientClipper {
    pub max_value: Option<f64>,
    pub max_norm: Option<f64>,
}

impl GradientClipper {
    pub fn new(max_value: Option<f64>, max_norm: Option<f64>) -> Self {
        Self {
            max_value,
            max_norm,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_value.is_some() || self.max_norm.is_some()
    }

    /// Clip the gradients of `model`'s parameters in place.
    ///
    /// Returns the global norm measured before the norm stage (after value
    /// clamping), or `None` when the norm stage is disabled.
    pub fn clip<B: AutodiffBackend>(
        &self,
        model: &GqRecalibratorNet<B>,
        grads: &mut GradientsParams,
    ) -> Option<f64> {
        let ids = model.parameter_ids();

        if let Some(max_value) = self.max_value {
            let bound = max_value as f32;
            for &id in &ids.weights {
                map_grad::<B::InnerBackend, 2>(grads, id, |g| g.clamp(-bound, bound));
            }
            for &id in &ids.biases {
                map_grad::<B::InnerBackend, 1>(grads, id, |g| g.clamp(-bound, bound));
            }
        }

        let max_norm = self.max_norm?;
        let squared: f64 = ids
            .weights
            .iter()
            .map(|&id| squared_norm::<B::InnerBackend, 2>(grads, id))
            .chain(
                ids.biases
                    .iter()
                    .map(|&id| squared_norm::<B::InnerBackend, 1>(grads, id)),
            )
            .sum();
        let norm = squared.sqrt();
        let factor = max_norm / (norm + NORM_EPSILON);
        if factor < 1.0 {
            for &id in &ids.weights {
                map_grad::<B::InnerBackend, 2>(grads, id, |g| g * factor);
            }
            for &id in &ids.biases {
                map_grad::<B::InnerBackend, 1>(grads, id, |g| g * factor);
            }
        }
        Some(norm)
    }
}

fn map_grad<B: Backend, const D: usize>(
    grads: &mut GradientsParams,
    id: ParamId,
    f: impl FnOnce(Tensor<B, D>) -> Tensor<B, D>,
) {
    if let Some(grad) = grads.remove::<B, D>(id) {
        grads.register::<B, D>(id, f(grad));
    }
}

fn squared_norm<B: Backend, const D: usize>(grads: &GradientsParams, id: ParamId) -> f64 {
    grads
        .get::<B, D>(id)
        .map(|g| g.powf_scalar(2.0).sum().into_scalar().elem::<f64>())
        .unwrap_or(0.0)
}
