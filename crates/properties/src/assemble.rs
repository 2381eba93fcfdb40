//! Turns raw corpus reads into scaled, labeled [`PropertyBatch`]es.

use crate::config::{LoaderConfig, ALLELE_COUNT_PROPERTY, MULTIALLELIC_PROPERTY};
use crate::corpus::{PropertyCorpus, DEFAULT_COPY_NUMBER};
use crate::plan::BatchSpec;
use crate::scaling::{PropertiesScaling, PropertyScaling};
use crate::truth::TruthMasks;
use crate::types::{LoaderError, PropertyBatch};
use std::sync::Arc;

/// Variants read per corpus call when screening for multiallelic sites.
const SCREEN_CHUNK_VARIANTS: usize = 1024;

/// A batch to build, tagged with its delivery position.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub sequence: u64,
    pub spec: BatchSpec,
}

/// Stateless batch builder shared by every worker.
pub struct BatchAssembler {
    corpus: Arc<dyn PropertyCorpus>,
    truth: Arc<TruthMasks>,
    feature_indices: Vec<usize>,
    feature_names: Vec<String>,
    feature_scaling: Vec<PropertyScaling>,
    target_index: usize,
    target_scaling: PropertyScaling,
    allele_count_index: Option<usize>,
    keep_homref: bool,
    keep_homvar: bool,
    /// Set when multiallelic variants are screened out.
    multiallelic_index: Option<usize>,
}

impl BatchAssembler {
    /// Features are every corpus property not listed in `excluded_properties`,
    /// in corpus column order.
    pub fn new(
        corpus: Arc<dyn PropertyCorpus>,
        truth: Arc<TruthMasks>,
        scaling: &PropertiesScaling,
        config: &LoaderConfig,
    ) -> Result<Self, LoaderError> {
        for excluded in &config.excluded_properties {
            if corpus.property_index(excluded).is_none() {
                tracing::warn!(property = %excluded, "Excluded property not present in corpus");
            }
        }

        let mut feature_indices = Vec::new();
        let mut feature_names = Vec::new();
        let mut feature_scaling = Vec::new();
        for (i, name) in corpus.property_names().iter().enumerate() {
            if config.excluded_properties.contains(name) {
                continue;
            }
            let s = scaling
                .get(name)
                .ok_or_else(|| LoaderError::MissingProperty(name.clone()))?;
            feature_indices.push(i);
            feature_names.push(name.clone());
            feature_scaling.push(s);
        }
        if feature_indices.is_empty() {
            return Err(LoaderError::Config(
                "every corpus property is excluded; no features remain".into(),
            ));
        }

        let target_index = corpus
            .property_index(&config.target_property)
            .ok_or_else(|| LoaderError::MissingProperty(config.target_property.clone()))?;
        let target_scaling = scaling
            .get(&config.target_property)
            .ok_or_else(|| LoaderError::MissingProperty(config.target_property.clone()))?;

        let allele_count_index = if config.keep_homref || config.keep_homvar {
            Some(
                corpus
                    .property_index(ALLELE_COUNT_PROPERTY)
                    .ok_or_else(|| LoaderError::MissingProperty(ALLELE_COUNT_PROPERTY.into()))?,
            )
        } else {
            None
        };

        let multiallelic_index = if config.keep_multiallelic {
            None
        } else {
            Some(
                corpus
                    .property_index(MULTIALLELIC_PROPERTY)
                    .ok_or_else(|| LoaderError::MissingProperty(MULTIALLELIC_PROPERTY.into()))?,
            )
        };

        Ok(Self {
            corpus,
            truth,
            feature_indices,
            feature_names,
            feature_scaling,
            target_index,
            target_scaling,
            allele_count_index,
            keep_homref: config.keep_homref,
            keep_homvar: config.keep_homvar,
            multiallelic_index,
        })
    }

    /// `rows` without multiallelic variants, unless those are kept.
    ///
    /// A variant is multiallelic when any genotype has a nonzero
    /// [`MULTIALLELIC_PROPERTY`]; missing values do not count.
    pub fn trainable_rows(&self, rows: &[usize]) -> Result<Vec<usize>, LoaderError> {
        let Some(p) = self.multiallelic_index else {
            return Ok(rows.to_vec());
        };
        let mut kept = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(SCREEN_CHUNK_VARIANTS) {
            let block = self.corpus.read_variants(chunk)?;
            for (v, &row) in block.rows.iter().enumerate() {
                let multiallelic = (0..block.num_samples).any(|s| {
                    let flag = block.value(v, s, p);
                    !flag.is_nan() && flag != 0.0
                });
                if !multiallelic {
                    kept.push(row);
                }
            }
        }
        tracing::info!(
            dropped = rows.len() - kept.len(),
            kept = kept.len(),
            "Screened out multiallelic variants"
        );
        Ok(kept)
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn num_features(&self) -> usize {
        self.feature_indices.len()
    }

    pub fn num_samples(&self) -> usize {
        self.corpus.num_samples()
    }

    pub fn assemble(&self, job: &BatchJob) -> Result<PropertyBatch, LoaderError> {
        let block = self.corpus.read_variants(&job.spec.rows)?;
        let nv = block.num_variants();
        let ns = block.num_samples;
        let nf = self.feature_indices.len();

        let mut batch_tensor = Vec::with_capacity(nv * ns * nf);
        let mut scaled_target = Vec::with_capacity(nv * ns);
        let mut genotype_is_good = Vec::with_capacity(nv * ns);
        let mut genotype_is_bad = Vec::with_capacity(nv * ns);
        let mut variant_ids = Vec::with_capacity(nv);

        for (v, &row) in block.rows.iter().enumerate() {
            let id = &self.corpus.variant_ids()[row];
            let labels = self.truth.labels(row).ok_or_else(|| {
                LoaderError::Corpus(format!("variant {id} has no truth labels"))
            })?;
            variant_ids.push(id.clone());

            for s in 0..ns {
                let copy_number = block
                    .expected_copy_number
                    .as_ref()
                    .map(|c| c[v * ns + s])
                    .filter(|c| !c.is_nan())
                    .unwrap_or(DEFAULT_COPY_NUMBER);

                for (&p, scaling) in self.feature_indices.iter().zip(&self.feature_scaling) {
                    batch_tensor.push(scaling.apply(block.value(v, s, p)));
                }

                let (mut good, mut bad) = (labels.good[s], labels.bad[s]);
                if let Some(ac) = self.allele_count_index {
                    let allele_count = block.value(v, s, ac);
                    let homref = self.keep_homref && allele_count == 0.0;
                    let homvar =
                        self.keep_homvar && copy_number > 0.0 && allele_count == copy_number;
                    if homref || homvar {
                        good = true;
                        bad = false;
                    }
                }

                if copy_number > 0.0 {
                    scaled_target.push(self.target_scaling.apply(block.value(v, s, self.target_index)));
                } else {
                    // no copies expected: nothing to genotype
                    scaled_target.push(0.0);
                    good = false;
                    bad = false;
                }
                genotype_is_good.push(good);
                genotype_is_bad.push(bad);
            }
        }

        let batch = PropertyBatch {
            sequence: job.sequence,
            kind: job.spec.kind,
            variant_ids,
            num_samples: ns,
            num_properties: nf,
            batch_tensor,
            variant_weights: block.variant_weights,
            scaled_target,
            genotype_is_good,
            genotype_is_bad,
        };
        batch.validate()?;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::InMemoryCorpus;
    use crate::truth::{TruthSet, VariantTruth};
    use crate::types::BatchKind;

    fn setup(corpus: InMemoryCorpus, truth: TruthSet, config: &LoaderConfig) -> BatchAssembler {
        let summary = corpus.summarize().unwrap();
        let scaling = PropertiesScaling::from_summary(&summary, false);
        let masks = truth.resolve(&corpus).unwrap();
        BatchAssembler::new(Arc::new(corpus), Arc::new(masks), &scaling, config).unwrap()
    }

    fn job(rows: Vec<usize>) -> BatchJob {
        BatchJob {
            sequence: 4,
            spec: BatchSpec {
                kind: BatchKind::Validation,
                rows,
            },
        }
    }

    fn label(good: &[&str], bad: &[&str]) -> VariantTruth {
        VariantTruth {
            good_variant_gts: good.iter().map(|s| s.to_string()).collect(),
            bad_variant_gts: bad.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_assemble_shapes_and_order() {
        let corpus = InMemoryCorpus::synthetic(4, 3, &["GQ", "SR", "allele_count"], 1);
        let truth = crate::mocks::truth_for_all(&corpus);
        let config = LoaderConfig {
            excluded_properties: vec!["SR".into()],
            ..LoaderConfig::default()
        };
        let assembler = setup(corpus, truth, &config);
        assert_eq!(assembler.feature_names(), &["GQ", "allele_count"]);

        let batch = assembler.assemble(&job(vec![3, 1])).unwrap();
        assert_eq!(batch.sequence, 4);
        assert_eq!(batch.kind, BatchKind::Validation);
        assert_eq!(batch.variant_ids, vec!["variant_3", "variant_1"]);
        assert_eq!(batch.num_properties, 2);
        assert_eq!(batch.batch_tensor.len(), 2 * 3 * 2);
        assert_eq!(batch.scaled_target.len(), 6);
    }

    #[test]
    fn test_missing_target_property() {
        let corpus = InMemoryCorpus::synthetic(2, 2, &["SR"], 1);
        let truth = crate::mocks::truth_for_all(&corpus);
        let summary = corpus.summarize().unwrap();
        let scaling = PropertiesScaling::from_summary(&summary, false);
        let masks = truth.resolve(&corpus).unwrap();
        let result = BatchAssembler::new(
            Arc::new(corpus),
            Arc::new(masks),
            &scaling,
            &LoaderConfig::default(),
        );
        assert!(matches!(result, Err(LoaderError::MissingProperty(p)) if p == "GQ"));
    }

    #[test]
    fn test_zero_copy_number_unlabels_genotype() {
        let mut corpus = InMemoryCorpus::synthetic(1, 2, &["GQ"], 1);
        corpus.set_copy_number(0, 1, 0.0);
        let mut truth = TruthSet::default();
        truth.insert("variant_0", label(&["sample_0"], &["sample_1"]));
        let assembler = setup(corpus, truth, &LoaderConfig::default());

        let batch = assembler.assemble(&job(vec![0])).unwrap();
        assert_eq!(batch.genotype_is_good, vec![true, false]);
        assert_eq!(batch.genotype_is_bad, vec![false, false]);
        assert_eq!(batch.scaled_target[1], 0.0);
    }

    #[test]
    fn test_keep_homref_marks_good() {
        let mut corpus = InMemoryCorpus::synthetic(1, 3, &["GQ", "allele_count"], 1);
        corpus.set_value(0, 0, 1, 0.0);
        corpus.set_value(0, 1, 1, 1.0);
        corpus.set_value(0, 2, 1, 2.0);
        let mut truth = TruthSet::default();
        truth.insert("variant_0", label(&[], &["sample_0", "sample_1"]));
        let config = LoaderConfig {
            keep_homref: true,
            ..LoaderConfig::default()
        };
        let assembler = setup(corpus, truth, &config);

        let batch = assembler.assemble(&job(vec![0])).unwrap();
        assert_eq!(batch.genotype_is_good, vec![true, false, false]);
        assert_eq!(batch.genotype_is_bad, vec![false, true, false]);
    }

    #[test]
    fn test_keep_homvar_uses_copy_number() {
        let mut corpus = InMemoryCorpus::synthetic(1, 2, &["GQ", "allele_count"], 1);
        corpus.set_value(0, 0, 1, 2.0);
        corpus.set_value(0, 1, 1, 1.0);
        corpus.set_copy_number(0, 1, 1.0);
        let mut truth = TruthSet::default();
        truth.insert("variant_0", label(&[], &["sample_0"]));
        let config = LoaderConfig {
            keep_homvar: true,
            ..LoaderConfig::default()
        };
        let assembler = setup(corpus, truth, &config);

        let batch = assembler.assemble(&job(vec![0])).unwrap();
        assert_eq!(batch.genotype_is_good, vec![true, true]);
        assert_eq!(batch.genotype_is_bad, vec![false, false]);
    }

    #[test]
    fn test_keep_homref_requires_allele_count() {
        let corpus = InMemoryCorpus::synthetic(2, 2, &["GQ"], 1);
        let truth = crate::mocks::truth_for_all(&corpus);
        let summary = corpus.summarize().unwrap();
        let scaling = PropertiesScaling::from_summary(&summary, false);
        let masks = truth.resolve(&corpus).unwrap();
        let config = LoaderConfig {
            keep_homref: true,
            ..LoaderConfig::default()
        };
        let result = BatchAssembler::new(Arc::new(corpus), Arc::new(masks), &scaling, &config);
        assert!(matches!(result, Err(LoaderError::MissingProperty(p)) if p == ALLELE_COUNT_PROPERTY));
    }

    /// Variant 1 is flagged on a single sample, variant 3 on every sample.
    fn multiallelic_corpus() -> InMemoryCorpus {
        let mut corpus = InMemoryCorpus::zeros(4, 2, &["GQ", MULTIALLELIC_PROPERTY]);
        corpus.set_value(1, 1, 1, 1.0);
        corpus.set_value(3, 0, 1, 1.0);
        corpus.set_value(3, 1, 1, 1.0);
        corpus.set_value(2, 0, 1, f32::NAN);
        corpus
    }

    #[test]
    fn test_keep_multiallelic_off_drops_flagged_variants() {
        let corpus = multiallelic_corpus();
        let truth = crate::mocks::truth_for_all(&corpus);
        let config = LoaderConfig {
            keep_multiallelic: false,
            ..LoaderConfig::default()
        };
        let assembler = setup(corpus, truth, &config);
        assert_eq!(assembler.trainable_rows(&[3, 2, 1, 0]).unwrap(), vec![2, 0]);
    }

    #[test]
    fn test_keep_multiallelic_keeps_everything() {
        let corpus = multiallelic_corpus();
        let truth = crate::mocks::truth_for_all(&corpus);
        let assembler = setup(corpus, truth, &LoaderConfig::default());
        assert_eq!(assembler.trainable_rows(&[0, 1, 2, 3]).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_keep_multiallelic_off_requires_flag_property() {
        let corpus = InMemoryCorpus::synthetic(2, 2, &["GQ"], 1);
        let truth = crate::mocks::truth_for_all(&corpus);
        let summary = corpus.summarize().unwrap();
        let scaling = PropertiesScaling::from_summary(&summary, false);
        let masks = truth.resolve(&corpus).unwrap();
        let config = LoaderConfig {
            keep_multiallelic: false,
            ..LoaderConfig::default()
        };
        let result = BatchAssembler::new(Arc::new(corpus), Arc::new(masks), &scaling, &config);
        assert!(matches!(result, Err(LoaderError::MissingProperty(p)) if p == MULTIALLELIC_PROPERTY));
    }

    #[test]
    fn test_unlabeled_after_copy_number_mask_is_error() {
        let mut corpus = InMemoryCorpus::synthetic(1, 2, &["GQ"], 1);
        corpus.set_copy_number(0, 0, 0.0);
        let mut truth = TruthSet::default();
        truth.insert("variant_0", label(&["sample_0"], &[]));
        let assembler = setup(corpus, truth, &LoaderConfig::default());
        assert!(matches!(
            assembler.assemble(&job(vec![0])),
            Err(LoaderError::NoLabeledGenotypes(_))
        ));
    }
}
