//! Versioned, device-independent training checkpoints.
//!
//! A checkpoint is one gzip-compressed JSON document. Tensor state (network
//! weights, optimizer moments) is embedded as burn `NamedMpk` bytes so the
//! file can be restored onto any backend.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use burn::optim::AdamWConfig;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use properties::{LoaderState, PropertiesScaling, PropertiesSummary};
use serde::{Deserialize, Serialize};

use crate::model::recalibrator::GqRecalibratorConfig;
use crate::training::metrics::LossHistory;
use crate::training::progress::ProgressLog;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

pub const ADAMW_OPTIMIZER: &str = "adamw";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decode checkpoint {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unsupported checkpoint format version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("checkpoint properties do not match the corpus: {0}")]
    PropertyMismatch(String),
    #[error("unsupported optimizer in checkpoint: {0}")]
    Optimizer(String),
    #[error("failed to restore {what} from checkpoint: {message}")]
    Record { what: &'static str, message: String },
}

/// Everything needed to resume training.
#[derive(Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub format_version: u32,
    pub logger: ProgressLog,
    pub loader: LoaderState,
    pub properties_summary: PropertiesSummary,
    pub properties_scaling: PropertiesScaling,
    pub net_config: GqRecalibratorConfig,
    /// `NamedMpkBytesRecorder` output for the network record.
    pub net_weights: Vec<u8>,
    pub optimizer_type: String,
    pub optimizer_config: AdamWConfig,
    pub learning_rate: f64,
    /// `NamedMpkBytesRecorder` output for the optimizer record.
    pub optimizer_state: Vec<u8>,
    pub losses: LossHistory,
}

impl CheckpointRecord {
    /// Fail unless the record's properties are exactly `property_names`.
    pub fn check_properties(&self, property_names: &[String]) -> Result<(), CheckpointError> {
        let saved: Vec<&str> = self.properties_summary.names().collect();
        let current: Vec<&str> = property_names.iter().map(String::as_str).collect();
        if saved != current {
            return Err(CheckpointError::PropertyMismatch(format!(
                "checkpoint has [{}], corpus has [{}]",
                saved.join(", "),
                current.join(", ")
            )));
        }
        Ok(())
    }
}

/// Write `record` to `path` atomically (temporary file, then rename).
pub fn write_checkpoint(path: &Path, record: &CheckpointRecord) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(io_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    let tmp_path = dir.join(format!(".{file_name}.tmp"));

    let file = File::create(&tmp_path).map_err(io_err)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    serde_json::to_writer(&mut encoder, record).map_err(CheckpointError::Encode)?;
    let mut writer = encoder.finish().map_err(io_err)?;
    writer.flush().map_err(io_err)?;
    drop(writer);

    std::fs::rename(&tmp_path, path).map_err(io_err)?;
    tracing::debug!(path = %path.display(), "Checkpoint written");
    Ok(())
}

/// Decode a checkpoint file, checking its format version.
pub fn read_checkpoint(path: &Path) -> Result<CheckpointRecord, CheckpointError> {
    let file = File::open(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode(path, file)
}

fn decode(path: &Path, file: File) -> Result<CheckpointRecord, CheckpointError> {
    let reader = GzDecoder::new(BufReader::new(file));
    let record: CheckpointRecord =
        serde_json::from_reader(reader).map_err(|source| CheckpointError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    if record.format_version != CHECKPOINT_FORMAT_VERSION {
        return Err(CheckpointError::Version {
            found: record.format_version,
            expected: CHECKPOINT_FORMAT_VERSION,
        });
    }
    if record.optimizer_type != ADAMW_OPTIMIZER {
        return Err(CheckpointError::Optimizer(record.optimizer_type));
    }
    Ok(record)
}

/// Checkpoint to resume from, if any.
///
/// No path or a missing file yields `Ok(None)`. A file that exists but cannot
/// be opened is logged and also yields `Ok(None)`. A file that opens but does
/// not decode is an error.
pub fn open_checkpoint(path: Option<&Path>) -> Result<Option<CheckpointRecord>, CheckpointError> {
    let Some(path) = path else {
        return Ok(None);
    };
    if !path.exists() {
        tracing::info!(path = %path.display(), "No checkpoint found, starting fresh");
        return Ok(None);
    }
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Checkpoint exists but cannot be opened, starting fresh"
            );
            return Ok(None);
        }
    };
    decode(path, file).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::metrics::{Phase, StepLosses};
    use properties::mocks::InMemoryCorpus;
    use properties::PropertyCorpus;
    use tempfile::TempDir;

    fn record() -> CheckpointRecord {
        let corpus = InMemoryCorpus::synthetic(4, 2, &["GQ", "SR"], 3);
        let summary = corpus.summarize().unwrap();
        let scaling = PropertiesScaling::from_summary(&summary, false);
        let mut losses = LossHistory::new();
        losses.append(
            Phase::Training,
            StepLosses {
                loss: 0.7,
                truth_agreement: 0.4,
                gq_correlation: 0.4,
            },
        );
        CheckpointRecord {
            format_version: CHECKPOINT_FORMAT_VERSION,
            logger: ProgressLog::default(),
            loader: LoaderState {
                format_version: properties::loader::LOADER_STATE_VERSION,
                random_seed: 3,
                shuffle: true,
                variants_per_batch: 2,
                keep_multiallelic: true,
                batches_consumed: 5,
            },
            properties_summary: summary,
            properties_scaling: scaling,
            net_config: GqRecalibratorConfig::new(2),
            net_weights: vec![1, 2, 3],
            optimizer_type: ADAMW_OPTIMIZER.into(),
            optimizer_config: AdamWConfig::new(),
            learning_rate: 1e-3,
            optimizer_state: vec![4, 5],
            losses,
        }
    }

    #[test]
    fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("model.ckpt");
        let original = record();
        write_checkpoint(&path, &original).unwrap();
        assert!(path.exists());
        assert!(!tmp.path().join("nested").join(".model.ckpt.tmp").exists());

        let back = read_checkpoint(&path).unwrap();
        assert_eq!(back.loader, original.loader);
        assert_eq!(back.losses, original.losses);
        assert_eq!(back.net_weights, original.net_weights);
        assert_eq!(back.optimizer_state, original.optimizer_state);
        assert_eq!(back.properties_summary, original.properties_summary);
    }

    #[test]
    fn test_file_is_gzip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model.ckpt");
        write_checkpoint(&path, &record()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_open_missing_is_fresh() {
        let tmp = TempDir::new().unwrap();
        assert!(open_checkpoint(None).unwrap().is_none());
        assert!(open_checkpoint(Some(&tmp.path().join("absent"))).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.ckpt");
        std::fs::write(&path, b"not a checkpoint").unwrap();
        assert!(matches!(
            open_checkpoint(Some(&path)),
            Err(CheckpointError::Decode { .. })
        ));
        // loading leaves the file alone
        assert_eq!(std::fs::read(&path).unwrap(), b"not a checkpoint");
    }

    #[test]
    fn test_loss_boundary_past_values_is_decode_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tampered.ckpt");
        let mut json = serde_json::to_value(record()).unwrap();
        json["losses"]["training_loss"]["mini_epoch_starts"] = serde_json::json!([0, 9]);
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        serde_json::to_writer(&mut encoder, &json).unwrap();
        encoder.finish().unwrap();

        assert!(matches!(
            read_checkpoint(&path),
            Err(CheckpointError::Decode { .. })
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("old.ckpt");
        let mut old = record();
        old.format_version = 99;
        write_checkpoint(&path, &old).unwrap();
        assert!(matches!(
            read_checkpoint(&path),
            Err(CheckpointError::Version { found: 99, .. })
        ));
    }

    #[test]
    fn test_property_check() {
        let rec = record();
        assert!(rec.check_properties(&["GQ".into(), "SR".into()]).is_ok());
        assert!(matches!(
            rec.check_properties(&["GQ".into()]),
            Err(CheckpointError::PropertyMismatch(_))
        ));
    }
}
