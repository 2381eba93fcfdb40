//! Data types shared by the corpus readers, the batch assembler, and the loader.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors raised while reading the corpus or producing batches.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// More variants per batch were requested than the training split holds.
    #[error("variants_per_batch ({requested}) exceeds the {available} available training variants")]
    BatchTooLarge { requested: usize, available: usize },

    /// The truth set names a variant that the property corpus does not contain.
    #[error("truth set references unknown variant: {0}")]
    UnknownVariant(String),

    /// The truth set names a sample that the property corpus does not contain.
    #[error("truth set references unknown sample {sample} for variant {variant}")]
    UnknownSample { variant: String, sample: String },

    /// An included variant has no genotype labeled good or bad.
    #[error("variant {0} has no labeled genotypes")]
    NoLabeledGenotypes(String),

    /// A genotype is labeled both good and bad.
    #[error("genotype of sample {sample} in variant {variant} is labeled both good and bad")]
    ConflictingLabels { variant: String, sample: String },

    /// A property required by the configuration is absent from the corpus.
    #[error("property not found in corpus: {0}")]
    MissingProperty(String),

    /// Structural problem with the corpus contents.
    #[error("malformed property corpus: {0}")]
    Corpus(String),

    /// Invalid loader configuration or cursor.
    #[error("invalid loader configuration: {0}")]
    Config(String),

    /// A worker failed (or panicked) while preparing a batch.
    #[error("batch worker failed on batch {sequence}: {message}")]
    Worker { sequence: u64, message: String },

    /// The worker pool hung up before delivering an in-flight batch.
    #[error("batch worker pool disconnected")]
    Disconnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Whether a batch updates parameters or only evaluates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Training,
    Validation,
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Training => write!(f, "training"),
            Self::Validation => write!(f, "validation"),
        }
    }
}

/// Raw (unscaled) property values for a set of variants, as read from a corpus.
///
/// `properties` is row-major `variants × samples × properties` and holds every
/// corpus property, `NaN` where a value is missing. Variants appear in the
/// order they were requested.
#[derive(Debug, Clone)]
pub struct VariantBlock {
    /// Corpus row (variant index) of each variant in the block.
    pub rows: Vec<usize>,
    pub num_samples: usize,
    pub num_properties: usize,
    pub properties: Vec<f32>,
    /// One weight per variant.
    pub variant_weights: Vec<f32>,
    /// Expected copy number per genotype (`variants × samples`), if the corpus has one.
    pub expected_copy_number: Option<Vec<f32>>,
}

impl VariantBlock {
    pub fn num_variants(&self) -> usize {
        self.rows.len()
    }

    /// Raw value of property `p` for sample `s` of the `v`-th variant in the block.
    pub fn value(&self, v: usize, s: usize, p: usize) -> f32 {
        self.properties[(v * self.num_samples + s) * self.num_properties + p]
    }
}

/// One unit of streamed training or validation data.
///
/// All matrices are row-major. `batch_tensor` is
/// `variants × samples × properties`; the genotype matrices are
/// `variants × samples`.
#[derive(Debug, Clone)]
pub struct PropertyBatch {
    /// Dispatch sequence number; batches are delivered in increasing order.
    pub sequence: u64,
    pub kind: BatchKind,
    pub variant_ids: Vec<String>,
    pub num_samples: usize,
    pub num_properties: usize,
    /// Scaled per-genotype property vectors.
    pub batch_tensor: Vec<f32>,
    pub variant_weights: Vec<f32>,
    /// Target quality values scaled to be centered near zero.
    pub scaled_target: Vec<f32>,
    pub genotype_is_good: Vec<bool>,
    pub genotype_is_bad: Vec<bool>,
}

impl PropertyBatch {
    pub fn num_variants(&self) -> usize {
        self.variant_ids.len()
    }

    pub fn is_training_batch(&self) -> bool {
        self.kind == BatchKind::Training
    }

    /// Check shapes and the label invariants.
    ///
    /// Good and bad must be mutually exclusive and every variant needs at
    /// least one labeled genotype, otherwise the agreement loss is undefined.
    pub fn validate(&self) -> Result<(), LoaderError> {
        let v = self.num_variants();
        let genotypes = v * self.num_samples;
        if self.variant_weights.len() != v
            || self.batch_tensor.len() != genotypes * self.num_properties
            || self.scaled_target.len() != genotypes
            || self.genotype_is_good.len() != genotypes
            || self.genotype_is_bad.len() != genotypes
        {
            return Err(LoaderError::Corpus(format!(
                "batch {} has inconsistent shapes for {v} variants x {} samples x {} properties",
                self.sequence, self.num_samples, self.num_properties
            )));
        }
        for (i, id) in self.variant_ids.iter().enumerate() {
            let range = i * self.num_samples..(i + 1) * self.num_samples;
            let good = &self.genotype_is_good[range.clone()];
            let bad = &self.genotype_is_bad[range];
            if let Some(s) = good.iter().zip(bad).position(|(g, b)| *g && *b) {
                return Err(LoaderError::ConflictingLabels {
                    variant: id.clone(),
                    sample: s.to_string(),
                });
            }
            if !good.iter().chain(bad).any(|&x| x) {
                return Err(LoaderError::NoLabeledGenotypes(id.clone()));
            }
        }
        Ok(())
    }
}
