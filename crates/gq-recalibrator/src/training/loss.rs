//! Truth-agreement + GQ-correlation loss for recalibrator training.
//!
//! All functions are generic over `B: Backend` and differentiable with
//! respect to `predicted`, the `(variants, samples)` probability that each
//! genotype call is good.

use burn::prelude::*;

use crate::model::bridge::{tensor_to_f64, BatchTensors};

/// Combined loss plus its two components, detached as `f64`.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    /// Scalar loss tensor of shape `(1,)`, still attached to the graph.
    pub loss: Tensor<B, 1>,
    pub truth_agreement: f64,
    pub gq_correlation: f64,
}

impl<B: Backend> LossOutput<B> {
    pub fn loss_value(&self) -> f64 {
        tensor_to_f64(self.loss.clone())
    }
}

/// Mean weighted disagreement between predictions and truth labels.
///
/// Per genotype the loss is `1 - p` when labeled good and `p` when labeled
/// bad, computed as `p * (bad - good) + good`. Each variant's loss is the sum
/// over samples divided by its number of labeled genotypes, so it lies in
/// `[0, 1]`. The result is the mean of `variant_loss * weight`.
pub fn truth_agreement_loss<B: Backend>(
    predicted: Tensor<B, 2>,
    is_good: Tensor<B, 2>,
    is_bad: Tensor<B, 2>,
    variant_weights: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let genotype_loss = predicted * (is_bad.clone() - is_good.clone()) + is_good.clone();
    let num_labeled = is_good.sum_dim(1) + is_bad.sum_dim(1); // (variants, 1)
    let variant_loss = (genotype_loss.sum_dim(1) / num_labeled).squeeze::<1>(1);
    (variant_loss * variant_weights).mean()
}

/// Mean weighted product of centered predictions and the scaled target.
///
/// Probabilities are mapped to `[-1, 1]` via `2 * (p - 0.5)`. There is no
/// variance normalization: scaling the targets scales the result.
pub fn gq_correlation<B: Backend>(
    predicted: Tensor<B, 2>,
    scaled_target: Tensor<B, 2>,
    variant_weights: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let variant_corr = variant_correlation(predicted, scaled_target);
    (variant_corr * variant_weights).mean()
}

/// Per-variant mean of `2 * (p - 0.5) * target`, shape `(variants,)`.
pub fn variant_correlation<B: Backend>(
    predicted: Tensor<B, 2>,
    scaled_target: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let adjusted = (predicted - 0.5) * 2.0;
    (adjusted * scaled_target).mean_dim(1).squeeze::<1>(1)
}

/// `truth_agreement + correlation_weight * (1 - gq_correlation)`.
pub fn recalibration_loss<B: Backend>(
    predicted: Tensor<B, 2>,
    batch: &BatchTensors<B>,
    correlation_weight: f64,
) -> LossOutput<B> {
    let agreement = truth_agreement_loss(
        predicted.clone(),
        batch.is_good.clone(),
        batch.is_bad.clone(),
        batch.variant_weights.clone(),
    );
    let correlation = gq_correlation(
        predicted,
        batch.scaled_target.clone(),
        batch.variant_weights.clone(),
    );
    let truth_agreement = tensor_to_f64(agreement.clone());
    let gq_correlation = tensor_to_f64(correlation.clone());
    let loss = agreement + (correlation.neg() + 1.0) * correlation_weight;
    LossOutput {
        loss,
        truth_agreement,
        gq_correlation,
    }
}
