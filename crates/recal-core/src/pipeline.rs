//! Training and checkpoint-inspection pipelines behind the CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use gq_recalibrator::training::progress::format_elapsed;
use gq_recalibrator::{
    init_optimizer, read_checkpoint, train, BatchReport, CheckpointRecord, DeviceKind,
    GqRecalibratorConfig, LossSeries, Nonlinearity, TrainingInputs, TrainingOutcome,
    TrainingState,
};
use properties::{BatchKind, LoaderState, ParquetPropertyCorpus, PropertyCorpus, TruthSet};

use crate::config::{
    load_train_toml, resolve, LoaderOverrides, NetworkOverrides, TrainToml, TrainingOverrides,
};

/// Arguments for the `train` subcommand.
#[derive(Debug, clap::Args)]
pub struct TrainArgs {
    /// Property corpus Parquet file (one row per variant and sample).
    #[arg(long)]
    pub properties: PathBuf,
    /// Truth JSON: variant id -> good/bad sample lists.
    #[arg(long)]
    pub truth_json: PathBuf,
    /// Output checkpoint, rewritten every mini-epoch and at exit.
    #[arg(long)]
    pub model: PathBuf,
    /// Checkpoint to resume from. Missing or unreadable files start fresh.
    #[arg(long)]
    pub input_model: Option<PathBuf>,
    /// Training config TOML with optional [loader], [training], [network] sections.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Compute device: cpu, or wgpu when built with the `wgpu` feature.
    #[arg(long)]
    pub device: Option<DeviceKind>,

    #[arg(long)]
    pub variants_per_batch: Option<usize>,
    #[arg(long)]
    pub shuffle: Option<bool>,
    #[arg(long)]
    pub random_seed: Option<u64>,
    #[arg(long)]
    pub validation_proportion: Option<f64>,
    #[arg(long)]
    pub num_epochs: Option<usize>,
    /// Comma-separated properties never used as inputs.
    #[arg(long, value_delimiter = ',')]
    pub excluded_properties: Option<Vec<String>>,
    #[arg(long)]
    pub scale_bool_properties: Option<bool>,
    /// Number of batch-preparation worker threads.
    #[arg(long)]
    pub num_workers: Option<usize>,
    #[arg(long)]
    pub max_look_ahead_batches: Option<usize>,
    #[arg(long)]
    pub target_property: Option<String>,
    #[arg(long)]
    pub keep_homref: Option<bool>,
    #[arg(long)]
    pub keep_homvar: Option<bool>,
    /// Set to false to leave multiallelic variants out of training.
    #[arg(long)]
    pub keep_multiallelic: Option<bool>,

    #[arg(long)]
    pub batches_per_mini_epoch: Option<usize>,
    /// Stop after training on this many variants in this run.
    #[arg(long)]
    pub max_train_variants: Option<u64>,
    #[arg(long)]
    pub learning_rate: Option<f64>,
    #[arg(long)]
    pub weight_decay: Option<f64>,
    /// Element-wise gradient clamp; 0 disables.
    #[arg(long)]
    pub max_gradient_value: Option<f64>,
    /// Global gradient-norm bound; 0 disables.
    #[arg(long)]
    pub max_gradient_norm: Option<f64>,
    #[arg(long)]
    pub correlation_loss_weight: Option<f64>,

    #[arg(long)]
    pub num_hidden_layers: Option<usize>,
    #[arg(long)]
    pub layer_expansion_factor: Option<f64>,
    #[arg(long)]
    pub bias: Option<bool>,
    /// silu, relu, gelu, tanh or sigmoid.
    #[arg(long)]
    pub hidden_nonlinearity: Option<Nonlinearity>,
}

impl TrainArgs {
    /// Flag values as the highest-priority config layer.
    pub fn overrides(&self) -> TrainToml {
        TrainToml {
            device: self.device,
            loader: LoaderOverrides {
                variants_per_batch: self.variants_per_batch,
                shuffle: self.shuffle,
                random_seed: self.random_seed,
                validation_proportion: self.validation_proportion,
                num_epochs: self.num_epochs,
                excluded_properties: self.excluded_properties.clone(),
                scale_bool_properties: self.scale_bool_properties,
                num_workers: self.num_workers,
                max_look_ahead_batches: self.max_look_ahead_batches,
                target_property: self.target_property.clone(),
                keep_homref: self.keep_homref,
                keep_homvar: self.keep_homvar,
                keep_multiallelic: self.keep_multiallelic,
            },
            training: TrainingOverrides {
                batches_per_mini_epoch: self.batches_per_mini_epoch,
                max_train_variants: self.max_train_variants,
                learning_rate: self.learning_rate,
                weight_decay: self.weight_decay,
                max_gradient_value: self.max_gradient_value,
                max_gradient_norm: self.max_gradient_norm,
                correlation_loss_weight: self.correlation_loss_weight,
            },
            network: NetworkOverrides {
                num_hidden_layers: self.num_hidden_layers,
                layer_expansion_factor: self.layer_expansion_factor,
                bias: self.bias,
                hidden_nonlinearity: self.hidden_nonlinearity,
            },
        }
    }
}

/// Arguments for the `summary` subcommand.
#[derive(Debug, clap::Args)]
pub struct SummaryArgs {
    /// Checkpoint written by `train`.
    #[arg(long)]
    pub checkpoint: PathBuf,
    /// Output as JSON instead of human-readable text.
    #[arg(long)]
    pub json: bool,
}

/// Train (or resume training) the recalibrator and write checkpoints to `--model`.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    // 1. Resolve config: defaults < TOML < flags
    let file = match &args.config {
        Some(path) => load_train_toml(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TrainToml::default(),
    };
    let resolved = resolve(&file, &args.overrides());
    if !resolved.device.is_available() {
        anyhow::bail!(
            "device {} is not available in this build (rebuild with --features wgpu)",
            resolved.device
        );
    }

    // 2. Open corpus and truth
    let corpus = ParquetPropertyCorpus::open(&args.properties)
        .with_context(|| format!("failed to open properties {}", args.properties.display()))?;
    tracing::info!(
        path = %args.properties.display(),
        variants = corpus.num_variants(),
        samples = corpus.num_samples(),
        properties = corpus.property_names().len(),
        "Opened property corpus"
    );
    let truth = TruthSet::from_json(&args.truth_json)
        .with_context(|| format!("failed to read truth {}", args.truth_json.display()))?;
    tracing::info!(variants = truth.len(), "Loaded truth labels");

    let inputs = TrainingInputs {
        corpus: Arc::new(corpus),
        truth,
        loader: resolved.loader,
        network: resolved.network,
        training: resolved.training,
    };

    // 3. Train on the requested backend
    tracing::info!(device = %resolved.device, "Selected device");
    let outcome = match resolved.device {
        DeviceKind::Cpu => train_on::<Autodiff<NdArray<f32>>>(&inputs, &args, &Default::default())?,
        #[cfg(feature = "wgpu")]
        DeviceKind::Wgpu => train_on::<Autodiff<burn::backend::Wgpu>>(
            &inputs,
            &args,
            &burn::backend::wgpu::WgpuDevice::default(),
        )?,
        #[cfg(not(feature = "wgpu"))]
        DeviceKind::Wgpu => anyhow::bail!("wgpu support was not compiled in"),
    };

    // 4. Print summary
    println!("\n--- Training Summary ---");
    println!("Batches: {}", outcome.batches);
    println!("Training batches: {}", outcome.training_batches);
    println!("Validation batches: {}", outcome.validation_batches);
    println!("Variants trained: {}", outcome.trained_variants);
    println!("Stopped: {}", outcome.stop_reason);
    println!("Checkpoint: {}", args.model.display());
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}

fn train_on<B: AutodiffBackend>(
    inputs: &TrainingInputs,
    args: &TrainArgs,
    device: &B::Device,
) -> anyhow::Result<TrainingOutcome> {
    let mut state = TrainingState::resume_or_build(
        inputs,
        init_optimizer::<B>,
        device,
        args.input_model.as_deref(),
    )?;

    let pb = ProgressBar::new(state.loader.batches_remaining());
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )?
        .progress_chars("=> "),
    );

    let outcome = train(&mut state, &inputs.training, &args.model, |report: &BatchReport| {
        let phase = match report.kind {
            BatchKind::Training => "train",
            BatchKind::Validation => "valid",
        };
        pb.set_message(format!("{phase} loss={:.4}", report.losses.loss));
        pb.inc(1);
    });
    pb.finish_with_message("done");
    outcome
}

/// Condensed view of a checkpoint for `summary`.
#[derive(Debug, Serialize)]
pub struct CheckpointSummary {
    pub format_version: u32,
    pub elapsed_secs: f64,
    pub loader: LoaderState,
    pub properties: Vec<String>,
    pub network: GqRecalibratorConfig,
    pub learning_rate: f64,
    pub series: BTreeMap<LossSeries, SeriesSummary>,
}

#[derive(Debug, Serialize)]
pub struct SeriesSummary {
    pub batches: usize,
    pub mini_epochs: usize,
    pub mini_epoch_means: Vec<f64>,
}

impl CheckpointSummary {
    pub fn from_record(record: &CheckpointRecord) -> Self {
        let series = record
            .losses
            .iter()
            .map(|(name, losses)| {
                (
                    name,
                    SeriesSummary {
                        batches: losses.len(),
                        mini_epochs: losses.num_mini_epochs(),
                        mini_epoch_means: losses.mini_epoch_means(),
                    },
                )
            })
            .collect();
        Self {
            format_version: record.format_version,
            elapsed_secs: record.logger.elapsed_secs,
            loader: record.loader.clone(),
            properties: record
                .properties_summary
                .names()
                .map(str::to_string)
                .collect(),
            network: record.net_config.clone(),
            learning_rate: record.learning_rate,
            series,
        }
    }
}

/// Print a checkpoint's loader cursor and loss history.
pub fn run_summary(args: SummaryArgs) -> anyhow::Result<()> {
    let record = read_checkpoint(&args.checkpoint)?;
    let summary = CheckpointSummary::from_record(&record);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("--- Checkpoint Summary ---");
    println!("File: {}", args.checkpoint.display());
    println!("Format version: {}", summary.format_version);
    println!("Training time: {}", format_elapsed(summary.elapsed_secs));
    println!(
        "Loader: {} batches consumed (seed {}, shuffle {}, {} variants/batch)",
        summary.loader.batches_consumed,
        summary.loader.random_seed,
        summary.loader.shuffle,
        summary.loader.variants_per_batch
    );
    println!("Properties: {}", summary.properties.join(", "));
    println!(
        "Network: {} inputs, {} hidden layers x {}, {}",
        summary.network.num_input_properties,
        summary.network.num_hidden_layers,
        summary.network.hidden_width(),
        summary.network.hidden_nonlinearity
    );
    println!("Learning rate: {}", summary.learning_rate);
    for (name, series) in &summary.series {
        let last = series
            .mini_epoch_means
            .last()
            .map(|m| format!("{m:.4}"))
            .unwrap_or_else(|| "-".to_string());
        let label = name.name();
        println!(
            "{label:<28} batches={:<6} mini_epochs={:<4} last_mean={last}",
            series.batches, series.mini_epochs
        );
    }

    Ok(())
}
