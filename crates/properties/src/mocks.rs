//! In-memory corpus for tests, with injectable latency and failures.

use crate::corpus::{PropertyCorpus, DEFAULT_COPY_NUMBER};
use crate::truth::{TruthSet, VariantTruth};
use crate::types::{LoaderError, VariantBlock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How a read touching a given row should misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Error,
    Panic,
}

/// [`PropertyCorpus`] holding all values in memory.
pub struct InMemoryCorpus {
    variant_ids: Vec<String>,
    sample_ids: Vec<String>,
    property_names: Vec<String>,
    bool_properties: Vec<bool>,
    values: Vec<f32>,
    weights: Vec<f32>,
    copy_number: Option<Vec<f32>>,
    read_delay: Option<fn(&[usize]) -> Duration>,
    failure: Option<(usize, InjectedFailure)>,
    reads: AtomicUsize,
}

impl InMemoryCorpus {
    /// All-zero corpus named `variant_{i}` / `sample_{j}`.
    pub fn zeros(num_variants: usize, num_samples: usize, property_names: &[&str]) -> Self {
        Self {
            variant_ids: (0..num_variants).map(|i| format!("variant_{i}")).collect(),
            sample_ids: (0..num_samples).map(|j| format!("sample_{j}")).collect(),
            property_names: property_names.iter().map(|s| s.to_string()).collect(),
            bool_properties: vec![false; property_names.len()],
            values: vec![0.0; num_variants * num_samples * property_names.len()],
            weights: vec![1.0; num_variants],
            copy_number: None,
            read_delay: None,
            failure: None,
            reads: AtomicUsize::new(0),
        }
    }

    /// Seeded random values. `GQ` is in `[0, 99]`, `allele_count` in `{0, 1, 2}`,
    /// anything else roughly unit-scale.
    pub fn synthetic(
        num_variants: usize,
        num_samples: usize,
        property_names: &[&str],
        seed: u64,
    ) -> Self {
        let mut corpus = Self::zeros(num_variants, num_samples, property_names);
        let mut rng = StdRng::seed_from_u64(seed);
        let np = property_names.len();
        for (i, value) in corpus.values.iter_mut().enumerate() {
            *value = match property_names[i % np] {
                "GQ" => rng.gen_range(0..100) as f32,
                "allele_count" => rng.gen_range(0..3) as f32,
                _ => rng.gen_range(-2.0f32..2.0),
            };
        }
        for w in corpus.weights.iter_mut() {
            *w = rng.gen_range(0.5f32..1.5);
        }
        corpus
    }

    pub fn with_bool_properties(mut self, names: &[&str]) -> Self {
        for (flag, name) in self.bool_properties.iter_mut().zip(&self.property_names) {
            *flag = names.contains(&name.as_str());
        }
        self
    }

    /// Sleep for `delay(rows)` before answering each read.
    pub fn with_read_delay(mut self, delay: fn(&[usize]) -> Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Fail every read that includes `row`.
    pub fn with_failure(mut self, row: usize, failure: InjectedFailure) -> Self {
        self.failure = Some((row, failure));
        self
    }

    pub fn set_value(&mut self, variant: usize, sample: usize, property: usize, value: f32) {
        let ns = self.sample_ids.len();
        let np = self.property_names.len();
        self.values[(variant * ns + sample) * np + property] = value;
    }

    pub fn set_weight(&mut self, variant: usize, weight: f32) {
        self.weights[variant] = weight;
    }

    pub fn set_copy_number(&mut self, variant: usize, sample: usize, copy_number: f32) {
        let ns = self.sample_ids.len();
        let total = self.variant_ids.len() * ns;
        let cn = self
            .copy_number
            .get_or_insert_with(|| vec![DEFAULT_COPY_NUMBER; total]);
        cn[variant * ns + sample] = copy_number;
    }

    /// Number of `read_variants` calls so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl PropertyCorpus for InMemoryCorpus {
    fn variant_ids(&self) -> &[String] {
        &self.variant_ids
    }

    fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    fn property_names(&self) -> &[String] {
        &self.property_names
    }

    fn bool_properties(&self) -> &[bool] {
        &self.bool_properties
    }

    fn read_variants(&self, rows: &[usize]) -> Result<VariantBlock, LoaderError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay(rows));
        }
        if let Some((row, failure)) = self.failure {
            if rows.contains(&row) {
                match failure {
                    InjectedFailure::Error => {
                        return Err(LoaderError::Corpus(format!("injected failure on row {row}")))
                    }
                    InjectedFailure::Panic => panic!("injected panic on row {row}"),
                }
            }
        }

        let ns = self.sample_ids.len();
        let np = self.property_names.len();
        let mut properties = Vec::with_capacity(rows.len() * ns * np);
        let mut variant_weights = Vec::with_capacity(rows.len());
        let mut copy_number = self
            .copy_number
            .as_ref()
            .map(|_| Vec::with_capacity(rows.len() * ns));
        for &r in rows {
            if r >= self.variant_ids.len() {
                return Err(LoaderError::Corpus(format!("variant row {r} out of range")));
            }
            properties.extend_from_slice(&self.values[r * ns * np..(r + 1) * ns * np]);
            variant_weights.push(self.weights[r]);
            if let (Some(out), Some(all)) = (copy_number.as_mut(), self.copy_number.as_ref()) {
                out.extend_from_slice(&all[r * ns..(r + 1) * ns]);
            }
        }

        Ok(VariantBlock {
            rows: rows.to_vec(),
            num_samples: ns,
            num_properties: np,
            properties,
            variant_weights,
            expected_copy_number: copy_number,
        })
    }
}

/// Label every genotype of every variant: sample `j` of variant `i` is bad
/// when `(i + j) % 3 == 0`, good otherwise.
pub fn truth_for_all(corpus: &dyn PropertyCorpus) -> TruthSet {
    let mut truth = TruthSet::default();
    for (i, id) in corpus.variant_ids().iter().enumerate() {
        let mut labels = VariantTruth::default();
        for (j, sample) in corpus.sample_ids().iter().enumerate() {
            if (i + j) % 3 == 0 {
                labels.bad_variant_gts.push(sample.clone());
            } else {
                labels.good_variant_gts.push(sample.clone());
            }
        }
        truth.insert(id.clone(), labels);
    }
    truth
}
