//! Partial ground-truth genotype labels.

use crate::corpus::PropertyCorpus;
use crate::types::LoaderError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Samples whose genotype call at a variant is known to be right or wrong.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantTruth {
    #[serde(default, alias = "good")]
    pub good_variant_gts: Vec<String>,
    #[serde(default, alias = "bad")]
    pub bad_variant_gts: Vec<String>,
}

/// Truth labels keyed by variant id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TruthSet {
    variants: BTreeMap<String, VariantTruth>,
}

impl TruthSet {
    pub fn new(variants: BTreeMap<String, VariantTruth>) -> Self {
        Self { variants }
    }

    /// Load `{variant_id: {good_variant_gts: [...], bad_variant_gts: [...]}}`.
    pub fn from_json(path: &Path) -> Result<Self, LoaderError> {
        let file = std::fs::File::open(path)?;
        let truth: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        tracing::info!(
            path = %path.display(),
            variants = truth.len(),
            "Loaded truth set"
        );
        Ok(truth)
    }

    pub fn insert(&mut self, variant_id: impl Into<String>, truth: VariantTruth) {
        self.variants.insert(variant_id.into(), truth);
    }

    pub fn get(&self, variant_id: &str) -> Option<&VariantTruth> {
        self.variants.get(variant_id)
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Map labels onto corpus rows and sample columns.
    ///
    /// Every truth variant and sample must exist in the corpus, no genotype may
    /// be both good and bad, and every variant needs at least one label.
    pub fn resolve(&self, corpus: &dyn PropertyCorpus) -> Result<TruthMasks, LoaderError> {
        let variant_rows: HashMap<&str, usize> = corpus
            .variant_ids()
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let sample_columns: HashMap<&str, usize> = corpus
            .sample_ids()
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let ns = corpus.num_samples();

        let mut labels = HashMap::with_capacity(self.variants.len());
        for (id, truth) in &self.variants {
            let row = *variant_rows
                .get(id.as_str())
                .ok_or_else(|| LoaderError::UnknownVariant(id.clone()))?;
            let mut good = vec![false; ns];
            let mut bad = vec![false; ns];
            for (names, mask) in [(&truth.good_variant_gts, &mut good), (&truth.bad_variant_gts, &mut bad)] {
                for sample in names {
                    let s = *sample_columns.get(sample.as_str()).ok_or_else(|| {
                        LoaderError::UnknownSample {
                            variant: id.clone(),
                            sample: sample.clone(),
                        }
                    })?;
                    mask[s] = true;
                }
            }
            if let Some(s) = good.iter().zip(&bad).position(|(g, b)| *g && *b) {
                return Err(LoaderError::ConflictingLabels {
                    variant: id.clone(),
                    sample: corpus.sample_ids()[s].clone(),
                });
            }
            if !good.iter().chain(&bad).any(|&x| x) {
                return Err(LoaderError::NoLabeledGenotypes(id.clone()));
            }
            labels.insert(row, GenotypeLabels { good, bad });
        }

        let mut rows: Vec<usize> = labels.keys().copied().collect();
        rows.sort_unstable();
        tracing::debug!(
            labeled_variants = rows.len(),
            corpus_variants = corpus.num_variants(),
            "Resolved truth labels"
        );
        Ok(TruthMasks { rows, labels })
    }
}

/// Per-sample good/bad flags for one variant.
#[derive(Debug, Clone, PartialEq)]
pub struct GenotypeLabels {
    pub good: Vec<bool>,
    pub bad: Vec<bool>,
}

/// Truth labels resolved against a corpus.
#[derive(Debug, Clone)]
pub struct TruthMasks {
    rows: Vec<usize>,
    labels: HashMap<usize, GenotypeLabels>,
}

impl TruthMasks {
    /// Corpus rows with truth labels, ascending. Only these are trained on.
    pub fn included_rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn labels(&self, row: usize) -> Option<&GenotypeLabels> {
        self.labels.get(&row)
    }
}
