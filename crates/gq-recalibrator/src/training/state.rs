//! Everything a training run owns, and how it is built, saved and restored.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use burn::optim::{AdamWConfig, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Record, Recorder};
use burn::tensor::backend::AutodiffBackend;
use properties::{
    BatchLoader, LoaderConfig, PropertiesScaling, PropertiesSummary, PropertyCorpus, TruthSet,
};

use crate::model::recalibrator::{GqRecalibratorConfig, GqRecalibratorNet};
use crate::training::checkpoint::{
    open_checkpoint, write_checkpoint, CheckpointError, CheckpointRecord, ADAMW_OPTIMIZER,
    CHECKPOINT_FORMAT_VERSION,
};
use crate::training::config::TrainingConfig;
use crate::training::metrics::{LossHistory, Phase, StepLosses};
use crate::training::progress::ProgressLogger;

type BytesRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Data sources and configuration for a run.
///
/// `network.num_input_properties` is ignored; the feature count comes from
/// the corpus after exclusions.
pub struct TrainingInputs {
    pub corpus: Arc<dyn PropertyCorpus>,
    pub truth: TruthSet,
    pub loader: LoaderConfig,
    pub network: GqRecalibratorConfig,
    pub training: TrainingConfig,
}

/// AdamW for the recalibrator network.
///
/// Passed to [`TrainingState::build`] and [`TrainingState::load`], which call
/// it with the optimizer config the state will record in checkpoints.
pub fn init_optimizer<B: AutodiffBackend>(
    config: &AdamWConfig,
) -> impl Optimizer<GqRecalibratorNet<B>, B> {
    config.init::<B, GqRecalibratorNet<B>>()
}

/// Model, optimizer, loader and loss history for one run.
pub struct TrainingState<B: AutodiffBackend, O> {
    pub logger: ProgressLogger,
    pub model: GqRecalibratorNet<B>,
    pub net_config: GqRecalibratorConfig,
    pub optimizer: O,
    pub optimizer_config: AdamWConfig,
    pub learning_rate: f64,
    pub loader: BatchLoader,
    pub losses: LossHistory,
    pub device: B::Device,
}

impl<B, O> TrainingState<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<GqRecalibratorNet<B>, B>,
{
    /// Fresh state: summarize the corpus, derive scaling, init the network.
    pub fn build<F>(inputs: &TrainingInputs, init_optimizer: F, device: &B::Device) -> anyhow::Result<Self>
    where
        F: FnOnce(&AdamWConfig) -> O,
    {
        inputs.training.validate()?;
        let mut logger = ProgressLogger::new();

        let loader = BatchLoader::new(
            Arc::clone(&inputs.corpus),
            &inputs.truth,
            inputs.loader.clone(),
        )
        .context("failed to build batch loader")?;

        let mut net_config = inputs.network.clone();
        net_config.num_input_properties = loader.num_properties();
        let model = net_config.init::<B>(device);

        logger.log(format!(
            "Built fresh training state: {} features, {} hidden layers of width {}, {} parameters",
            net_config.num_input_properties,
            net_config.num_hidden_layers,
            net_config.hidden_width(),
            model.num_params(),
        ));

        let optimizer_config = inputs.training.optimizer_config();
        let optimizer = init_optimizer(&optimizer_config);

        Ok(Self {
            logger,
            model,
            net_config,
            optimizer,
            optimizer_config,
            learning_rate: inputs.training.learning_rate,
            loader,
            losses: LossHistory::new(),
            device: device.clone(),
        })
    }

    /// Rebuild from a checkpoint.
    ///
    /// The loader is reconstructed from the corpus and the saved cursor; the
    /// network is re-initialized from the saved architecture and then given
    /// the saved weights. The optimizer is built from the saved AdamW config
    /// and given the saved moments. Learning rate, losses and the progress
    /// log also come from the checkpoint.
    pub fn load<F>(
        inputs: &TrainingInputs,
        init_optimizer: F,
        device: &B::Device,
        record: CheckpointRecord,
    ) -> anyhow::Result<Self>
    where
        F: FnOnce(&AdamWConfig) -> O,
    {
        inputs.training.validate()?;
        record.check_properties(inputs.corpus.property_names())?;

        let loader = BatchLoader::resume(
            Arc::clone(&inputs.corpus),
            &inputs.truth,
            inputs.loader.clone(),
            record.properties_summary,
            record.properties_scaling,
            &record.loader,
        )
        .context("failed to resume batch loader")?;

        let net_config = record.net_config;
        if loader.num_properties() != net_config.num_input_properties {
            return Err(CheckpointError::PropertyMismatch(format!(
                "network expects {} features, corpus provides {}",
                net_config.num_input_properties,
                loader.num_properties()
            ))
            .into());
        }
        if inputs.network.num_hidden_layers != net_config.num_hidden_layers
            || inputs.network.layer_expansion_factor != net_config.layer_expansion_factor
            || inputs.network.bias != net_config.bias
            || inputs.network.hidden_nonlinearity != net_config.hidden_nonlinearity
        {
            tracing::warn!("Network settings differ from the checkpoint; using the saved architecture");
        }

        let weights = from_bytes::<B, _>(record.net_weights, device, "network weights")?;
        let model = net_config.init::<B>(device).load_record(weights);
        let saved_optimizer = config_json(&record.optimizer_config);
        let configured_optimizer = config_json(&inputs.training.optimizer_config());
        if saved_optimizer != configured_optimizer {
            tracing::warn!(
                saved = %saved_optimizer,
                configured = %configured_optimizer,
                "Optimizer settings differ from the checkpoint; using the saved values"
            );
        }
        let optimizer_record = from_bytes::<B, O::Record>(record.optimizer_state, device, "optimizer state")?;
        let optimizer = init_optimizer(&record.optimizer_config).load_record(optimizer_record);

        if record.learning_rate != inputs.training.learning_rate {
            tracing::warn!(
                saved = record.learning_rate,
                configured = inputs.training.learning_rate,
                "Learning rate differs from the checkpoint; using the saved value"
            );
        }

        let mut logger = ProgressLogger::resume(record.logger);
        logger.log(format!(
            "Resumed from checkpoint at batch {} ({} training batches so far)",
            record.loader.batches_consumed,
            record.losses.num_batches(Phase::Training),
        ));

        Ok(Self {
            logger,
            model,
            net_config,
            optimizer,
            optimizer_config: record.optimizer_config,
            learning_rate: record.learning_rate,
            loader,
            losses: record.losses,
            device: device.clone(),
        })
    }

    /// Load from `checkpoint` when it holds a usable file, otherwise build fresh.
    pub fn resume_or_build<F>(
        inputs: &TrainingInputs,
        init_optimizer: F,
        device: &B::Device,
        checkpoint: Option<&Path>,
    ) -> anyhow::Result<Self>
    where
        F: FnOnce(&AdamWConfig) -> O,
    {
        match open_checkpoint(checkpoint)? {
            Some(record) => Self::load(inputs, init_optimizer, device, record),
            None => Self::build(inputs, init_optimizer, device),
        }
    }

    /// Detached, device-independent snapshot of the whole state.
    pub fn to_record(&self) -> anyhow::Result<CheckpointRecord> {
        let net_weights = to_bytes::<B, _>(self.model.clone().into_record(), "network weights")?;
        let optimizer_state = to_bytes::<B, _>(self.optimizer.to_record(), "optimizer state")?;
        Ok(CheckpointRecord {
            format_version: CHECKPOINT_FORMAT_VERSION,
            logger: self.logger.to_log(),
            loader: self.loader.state(),
            properties_summary: self.loader.properties_summary().clone(),
            properties_scaling: self.loader.properties_scaling().clone(),
            net_config: self.net_config.clone(),
            net_weights,
            optimizer_type: ADAMW_OPTIMIZER.to_string(),
            optimizer_config: self.optimizer_config.clone(),
            learning_rate: self.learning_rate,
            optimizer_state,
            losses: self.losses.clone(),
        })
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let record = self.to_record()?;
        write_checkpoint(path, &record)
            .with_context(|| format!("failed to save checkpoint to {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            batches_consumed = record.loader.batches_consumed,
            "Saved checkpoint"
        );
        Ok(())
    }

    pub fn append_losses(&mut self, phase: Phase, step: StepLosses) {
        self.losses.append(phase, step);
    }

    pub fn properties_summary(&self) -> &PropertiesSummary {
        self.loader.properties_summary()
    }

    pub fn properties_scaling(&self) -> &PropertiesScaling {
        self.loader.properties_scaling()
    }
}

/// `AdamWConfig` has no `PartialEq`; configs are compared as JSON.
fn config_json(config: &AdamWConfig) -> serde_json::Value {
    serde_json::to_value(config).unwrap_or(serde_json::Value::Null)
}

fn to_bytes<B: Backend, R: Record<B>>(item: R, what: &'static str) -> Result<Vec<u8>, CheckpointError> {
    <BytesRecorder as Recorder<B>>::record(&BytesRecorder::new(), item, ()).map_err(|e| {
        CheckpointError::Record {
            what,
            message: e.to_string(),
        }
    })
}

fn from_bytes<B: Backend, R: Record<B>>(
    bytes: Vec<u8>,
    device: &B::Device,
    what: &'static str,
) -> Result<R, CheckpointError> {
    <BytesRecorder as Recorder<B>>::load(&BytesRecorder::new(), bytes, device).map_err(|e| {
        CheckpointError::Record {
            what,
            message: e.to_string(),
        }
    })
}
