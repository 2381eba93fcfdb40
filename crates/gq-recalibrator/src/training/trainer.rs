//! Training loop: streams batches from the loader, steps AdamW on training
//! batches, evaluates validation batches, and checkpoints every mini-epoch.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use properties::{BatchKind, PropertyBatch};

use crate::model::bridge::BatchTensors;
use crate::model::recalibrator::GqRecalibratorNet;
use crate::training::clipping::GradientClipper;
use crate::training::config::TrainingConfig;
use crate::training::loss::{recalibration_loss, LossOutput};
use crate::training::metrics::{LossSeries, Phase, StepLosses};
use crate::training::state::TrainingState;

/// Why [`train`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every scheduled batch was consumed.
    LoaderExhausted,
    /// The run trained on at least `max_train_variants` variants.
    MaxTrainVariants,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LoaderExhausted => "all batches consumed",
            Self::MaxTrainVariants => "max_train_variants reached",
        })
    }
}

/// Counts for the current run only (not accumulated across resumes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingOutcome {
    pub batches: u64,
    pub training_batches: u64,
    pub validation_batches: u64,
    pub trained_variants: u64,
    pub stop_reason: StopReason,
}

/// Per-batch callback payload.
#[derive(Debug, Clone, Copy)]
pub struct BatchReport {
    pub kind: BatchKind,
    pub losses: StepLosses,
}

/// Train until the loader is exhausted or `max_train_variants` is reached.
///
/// A checkpoint is written to `checkpoint_path` at every mini-epoch boundary
/// and once more on exit. `on_batch` is called after each batch, e.g. to
/// advance a progress bar.
pub fn train<B, O>(
    state: &mut TrainingState<B, O>,
    config: &TrainingConfig,
    checkpoint_path: &Path,
    mut on_batch: impl FnMut(&BatchReport),
) -> anyhow::Result<TrainingOutcome>
where
    B: AutodiffBackend,
    O: Optimizer<GqRecalibratorNet<B>, B>,
{
    config.validate()?;
    let clipper = config.clipper();
    // a short final batch still counts as a full batch of variants
    let variants_per_batch = state.loader.config().variants_per_batch as u64;

    tracing::info!(
        batches_remaining = state.loader.batches_remaining(),
        batches_per_mini_epoch = config.batches_per_mini_epoch,
        max_train_variants = ?config.max_train_variants,
        learning_rate = state.learning_rate,
        correlation_loss_weight = config.correlation_loss_weight,
        max_gradient_value = ?clipper.max_value,
        max_gradient_norm = ?clipper.max_norm,
        "Starting training"
    );

    let mut batches = 0u64;
    let mut training_batches = 0u64;
    let mut validation_batches = 0u64;
    let mut trained_variants = 0u64;

    let stop_reason = loop {
        let Some(batch) = state
            .loader
            .next_batch()
            .context("batch loader failed")?
        else {
            break StopReason::LoaderExhausted;
        };
        batches += 1;

        match batch.kind {
            BatchKind::Training => {
                let losses = training_step(state, &batch, config, &clipper)?;
                state.append_losses(Phase::Training, losses);
                training_batches += 1;
                trained_variants += variants_per_batch;
                on_batch(&BatchReport {
                    kind: batch.kind,
                    losses,
                });

                if state.losses.get(LossSeries::TrainingLoss).num_mini_epoch_batches()
                    >= config.batches_per_mini_epoch
                {
                    finish_mini_epoch(state, checkpoint_path)?;
                }
                if config
                    .max_train_variants
                    .is_some_and(|max| trained_variants >= max)
                {
                    break StopReason::MaxTrainVariants;
                }
            }
            BatchKind::Validation => {
                let losses = validation_step(state, &batch, config)?;
                state.append_losses(Phase::Validation, losses);
                validation_batches += 1;
                on_batch(&BatchReport {
                    kind: batch.kind,
                    losses,
                });
            }
        }
    };

    log_mini_epoch_summary(state, "Final");
    state.save(checkpoint_path)?;
    state.logger.log(format!(
        "Processed {batches} batches ({training_batches} training, {validation_batches} validation, \
         {trained_variants} variants trained); stopped: {stop_reason}"
    ));

    Ok(TrainingOutcome {
        batches,
        training_batches,
        validation_batches,
        trained_variants,
        stop_reason,
    })
}

fn training_step<B, O>(
    state: &mut TrainingState<B, O>,
    batch: &PropertyBatch,
    config: &TrainingConfig,
    clipper: &GradientClipper,
) -> anyhow::Result<StepLosses>
where
    B: AutodiffBackend,
    O: Optimizer<GqRecalibratorNet<B>, B>,
{
    let tensors = BatchTensors::<B>::from_batch(batch, &state.device);
    let predicted = state.model.forward(tensors.properties.clone());
    let output = recalibration_loss(predicted, &tensors, config.correlation_loss_weight);
    let losses = step_losses(&output, batch)?;

    let mut grads = GradientsParams::from_grads(output.loss.backward(), &state.model);
    if clipper.is_enabled() {
        clipper.clip(&state.model, &mut grads);
    }
    state.model = state
        .optimizer
        .step(state.learning_rate, state.model.clone(), grads);
    Ok(losses)
}

/// Forward pass on the inner (non-autodiff) module; no graph is recorded.
fn validation_step<B, O>(
    state: &TrainingState<B, O>,
    batch: &PropertyBatch,
    config: &TrainingConfig,
) -> anyhow::Result<StepLosses>
where
    B: AutodiffBackend,
    O: Optimizer<GqRecalibratorNet<B>, B>,
{
    let model = state.model.valid();
    let tensors = BatchTensors::<B::InnerBackend>::from_batch(batch, &state.device);
    let predicted = model.forward(tensors.properties.clone());
    let output = recalibration_loss(predicted, &tensors, config.correlation_loss_weight);
    step_losses(&output, batch)
}

fn step_losses<B: Backend>(output: &LossOutput<B>, batch: &PropertyBatch) -> anyhow::Result<StepLosses> {
    let losses = StepLosses {
        loss: output.loss_value(),
        truth_agreement: output.truth_agreement,
        gq_correlation: output.gq_correlation,
    };
    if !(losses.loss.is_finite()
        && losses.truth_agreement.is_finite()
        && losses.gq_correlation.is_finite())
    {
        anyhow::bail!(
            "non-finite loss on batch {} ({:?}, first variant {:?}): loss={} truth_agreement={} gq_correlation={}",
            batch.sequence,
            batch.kind,
            batch.variant_ids.first(),
            losses.loss,
            losses.truth_agreement,
            losses.gq_correlation,
        );
    }
    Ok(losses)
}

fn finish_mini_epoch<B, O>(state: &mut TrainingState<B, O>, checkpoint_path: &Path) -> anyhow::Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<GqRecalibratorNet<B>, B>,
{
    let label = format!(
        "Mini-epoch {}",
        state.losses.get(LossSeries::TrainingLoss).num_mini_epochs()
    );
    log_mini_epoch_summary(state, &label);
    state.losses.next_mini_epoch();
    state.save(checkpoint_path)
}

fn log_mini_epoch_summary<B: AutodiffBackend, O>(state: &mut TrainingState<B, O>, label: &str) {
    let means = state.losses.mini_epoch_means();
    let mean = |series: LossSeries| means.get(&series).copied().unwrap_or(f64::NAN);
    let training = state.losses.get(LossSeries::TrainingLoss).num_mini_epoch_batches();
    let validation = state
        .losses
        .get(LossSeries::ValidationLoss)
        .num_mini_epoch_batches();
    let message = format!(
        "{label}: {training} training / {validation} validation batches | \
         training loss={:.4} truth_agreement={:.4} gq_correlation={:.4} | \
         validation loss={:.4} truth_agreement={:.4} gq_correlation={:.4}",
        mean(LossSeries::TrainingLoss),
        mean(LossSeries::TrainingTruthAgreement),
        mean(LossSeries::TrainingGqCorrelation),
        mean(LossSeries::ValidationLoss),
        mean(LossSeries::ValidationTruthAgreement),
        mean(LossSeries::ValidationGqCorrelation),
    );
    state.logger.log(message);
}
