//! Integration tests for the recalibrator crate.
//!
//! These exercise cross-module behavior: loader -> bridge -> model -> loss ->
//! optimizer, and the checkpoint save/load cycle. All use the NdArray backend
//! and synthetic corpora.

use std::path::Path;
use std::sync::Arc;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Record, Recorder};
use burn::tensor::TensorData;
use tempfile::TempDir;

use gq_recalibrator::{
    init_optimizer, read_checkpoint, train, GqRecalibratorConfig, GqRecalibratorNet, LossSeries,
    Phase, StopReason, TrainingConfig, TrainingInputs, TrainingState,
};
use properties::mocks::{truth_for_all, InMemoryCorpus};
use properties::{CorpusWriter, LoaderConfig, ParquetPropertyCorpus, PropertyCorpus, TruthSet};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

/// 30 variants x 4 samples: 24 training (6 batches of 4), 6 validation (2 batches).
fn inputs(training: TrainingConfig) -> TrainingInputs {
    let corpus = Arc::new(InMemoryCorpus::synthetic(30, 4, &["GQ", "SR", "RD"], 21));
    TrainingInputs {
        truth: truth_for_all(corpus.as_ref()),
        corpus,
        loader: LoaderConfig {
            variants_per_batch: 4,
            num_workers: 3,
            max_look_ahead_batches: 2,
            ..LoaderConfig::default()
        },
        network: GqRecalibratorConfig::new(0).with_num_hidden_layers(2),
        training,
    }
}

fn open(
    inputs: &TrainingInputs,
    checkpoint: Option<&Path>,
) -> TrainingState<TestAutodiffBackend, impl Optimizer<GqRecalibratorNet<TestAutodiffBackend>, TestAutodiffBackend>>
{
    let device = Default::default();
    TrainingState::resume_or_build(
        inputs,
        init_optimizer::<TestAutodiffBackend>,
        &device,
        checkpoint,
    )
    .unwrap()
}

/// Evaluate a network on a fixed input so two models can be compared.
fn fixed_input_output(model: &GqRecalibratorNet<TestAutodiffBackend>) -> Vec<f32> {
    let device = Default::default();
    let values: Vec<f32> = (0..36).map(|i| (i as f32 * 0.37).sin() * 2.0).collect();
    let input = Tensor::<TestBackend, 3>::from_data(TensorData::new(values, [3, 4, 3]), &device);
    model.valid().forward(input).into_data().to_vec().unwrap()
}

/// Decode a checkpoint's optimizer state into JSON, where per-parameter
/// entries compare independently of their encoded order.
fn optimizer_moments<O>(
    _state: &TrainingState<TestAutodiffBackend, O>,
    bytes: Vec<u8>,
) -> serde_json::Value
where
    O: Optimizer<GqRecalibratorNet<TestAutodiffBackend>, TestAutodiffBackend>,
{
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::new();
    let record: O::Record =
        Recorder::<TestAutodiffBackend>::load(&recorder, bytes, &Default::default()).unwrap();
    serde_json::to_value(record.into_item::<FullPrecisionSettings>()).unwrap()
}

fn weight_decay<O>(state: &TrainingState<TestAutodiffBackend, O>) -> f64 {
    serde_json::to_value(&state.optimizer_config).unwrap()["weight_decay"]
        .as_f64()
        .unwrap()
}

fn assert_close(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-6, "{x} != {y}");
    }
}

#[test]
fn test_save_load_restores_equivalent_state() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("model.ckpt");
    let inputs = inputs(TrainingConfig::new().with_max_train_variants(Some(8)));

    let mut original = open(&inputs, None);
    let outcome = train(&mut original, &inputs.training, &path, |_| {}).unwrap();
    assert_eq!(outcome.stop_reason, StopReason::MaxTrainVariants);

    let restored = open(&inputs, Some(&path));
    let a = original.to_record().unwrap();
    let b = restored.to_record().unwrap();
    assert_eq!(a.loader, b.loader);
    assert_eq!(a.losses, b.losses);
    assert_eq!(a.net_weights, b.net_weights);
    assert_eq!(a.properties_summary, b.properties_summary);
    assert_eq!(a.learning_rate, b.learning_rate);
    assert_eq!(a.optimizer_type, b.optimizer_type);
    assert_eq!(
        serde_json::to_value(&a.optimizer_config).unwrap(),
        serde_json::to_value(&b.optimizer_config).unwrap()
    );
    assert_eq!(fixed_input_output(&original.model), fixed_input_output(&restored.model));

    let moments = optimizer_moments(&original, a.optimizer_state);
    assert!(!moments.as_object().unwrap().is_empty());
    assert_eq!(moments, optimizer_moments(&restored, b.optimizer_state));
}

/// AdamW settings travel with the checkpoint, so a resumed run keeps the
/// saved weight decay even when the new config asks for another.
#[test]
fn test_resume_keeps_saved_weight_decay() {
    let tmp = TempDir::new().unwrap();
    let first = tmp.path().join("first.ckpt");
    let limited = inputs(
        TrainingConfig::new()
            .with_weight_decay(0.5)
            .with_max_train_variants(Some(8)),
    );
    let mut in_memory = open(&limited, None);
    train(&mut in_memory, &limited.training, &first, |_| {}).unwrap();

    let unlimited = inputs(TrainingConfig::new());
    let mut from_disk = open(&unlimited, Some(&first));
    assert_eq!(weight_decay(&from_disk), 0.5);

    train(&mut in_memory, &unlimited.training, &tmp.path().join("a.ckpt"), |_| {}).unwrap();
    let b_path = tmp.path().join("b.ckpt");
    train(&mut from_disk, &unlimited.training, &b_path, |_| {}).unwrap();

    let out_a = fixed_input_output(&in_memory.model);
    let out_b = fixed_input_output(&from_disk.model);
    for (x, y) in out_a.iter().zip(&out_b) {
        assert!((x - y).abs() < 1e-6, "{x} != {y}");
    }
    let saved = read_checkpoint(&b_path).unwrap();
    assert_eq!(
        serde_json::to_value(&saved.optimizer_config).unwrap()["weight_decay"],
        serde_json::json!(0.5)
    );
}

/// Continuing in memory and continuing from the checkpoint give the same model,
/// which requires the optimizer moments to have been restored exactly.
#[test]
fn test_resumed_training_matches_uninterrupted() {
    let tmp = TempDir::new().unwrap();
    let first = tmp.path().join("first.ckpt");
    let limited = inputs(TrainingConfig::new().with_max_train_variants(Some(8)));
    let mut in_memory = open(&limited, None);
    train(&mut in_memory, &limited.training, &first, |_| {}).unwrap();

    let unlimited = inputs(TrainingConfig::new());
    let mut from_disk = open(&unlimited, Some(&first));

    let a = train(&mut in_memory, &unlimited.training, &tmp.path().join("a.ckpt"), |_| {}).unwrap();
    let b = train(&mut from_disk, &unlimited.training, &tmp.path().join("b.ckpt"), |_| {}).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.stop_reason, StopReason::LoaderExhausted);

    let out_a = fixed_input_output(&in_memory.model);
    let out_b = fixed_input_output(&from_disk.model);
    for (x, y) in out_a.iter().zip(&out_b) {
        assert!((x - y).abs() < 1e-6, "{x} != {y}");
    }
    for (series, losses) in in_memory.losses.iter() {
        let other = from_disk.losses.get(series);
        assert_eq!(losses.mini_epoch_starts(), other.mini_epoch_starts());
        assert_close(losses.values(), other.values());
    }
    assert_eq!(in_memory.losses.num_batches(Phase::Training), 6);
}

#[test]
fn test_training_reduces_truth_disagreement() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("model.ckpt");
    let mut inputs = inputs(
        TrainingConfig::new()
            .with_learning_rate(1e-2)
            .with_max_gradient_value(None)
            .with_max_gradient_norm(None)
            .with_correlation_loss_weight(0.0)
            .with_batches_per_mini_epoch(6),
    );
    inputs.loader.num_epochs = 15;
    inputs.loader.validation_proportion = 0.1;

    let mut state = open(&inputs, None);
    train(&mut state, &inputs.training, &path, |_| {}).unwrap();

    let means = state.losses.get(LossSeries::TrainingTruthAgreement).mini_epoch_means();
    let first = means[0];
    let last = *means.last().unwrap();
    assert!(last < first, "truth agreement did not improve: {first} -> {last}");
}

#[test]
fn test_parquet_corpus_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let source = InMemoryCorpus::synthetic(20, 3, &["GQ", "SR"], 2);
    let parquet = tmp.path().join("properties.parquet");
    let mut writer = CorpusWriter::new(
        parquet.clone(),
        source.sample_ids().to_vec(),
        source.property_names().to_vec(),
    )
    .with_max_row_group_size(9);
    writer.record_corpus(&source).unwrap();
    writer.finish().unwrap();

    let truth_path = tmp.path().join("truth.json");
    std::fs::write(&truth_path, serde_json::to_string(&truth_for_all(&source)).unwrap()).unwrap();

    let inputs = TrainingInputs {
        corpus: Arc::new(ParquetPropertyCorpus::open(&parquet).unwrap()),
        truth: TruthSet::from_json(&truth_path).unwrap(),
        loader: LoaderConfig {
            variants_per_batch: 4,
            ..LoaderConfig::default()
        },
        network: GqRecalibratorConfig::new(0),
        training: TrainingConfig::new(),
    };
    let checkpoint = tmp.path().join("model.ckpt");
    let mut state = open(&inputs, None);
    let outcome = train(&mut state, &inputs.training, &checkpoint, |_| {}).unwrap();
    assert_eq!(outcome.training_batches, 4);

    let record = read_checkpoint(&checkpoint).unwrap();
    assert_eq!(record.net_config.num_input_properties, 2);
    assert!(record
        .losses
        .get(LossSeries::ValidationTruthAgreement)
        .values()
        .iter()
        .all(|v| (0.0..=1.5).contains(v)));
}
