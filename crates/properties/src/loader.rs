//! Ordered, bounded-look-ahead batch streaming.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::assemble::{BatchAssembler, BatchJob};
use crate::config::LoaderConfig;
use crate::corpus::PropertyCorpus;
use crate::plan::{BatchSpec, TraversalPlan};
use crate::pool::WorkerPool;
use crate::scaling::{PropertiesScaling, PropertiesSummary};
use crate::truth::TruthSet;
use crate::types::{LoaderError, PropertyBatch};

pub const LOADER_STATE_VERSION: u32 = 1;

/// Resumable traversal cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderState {
    pub format_version: u32,
    pub random_seed: u64,
    pub shuffle: bool,
    pub variants_per_batch: usize,
    /// Whether multiallelic variants were part of the traversal.
    #[serde(default = "default_keep_multiallelic")]
    pub keep_multiallelic: bool,
    /// Batches handed to the consumer so far.
    pub batches_consumed: u64,
}

fn default_keep_multiallelic() -> bool {
    true
}

/// Streams [`PropertyBatch`]es produced by a [`WorkerPool`].
///
/// Batches come out in traversal order no matter which worker finishes
/// first. At most `max_look_ahead_batches` batches are ever dispatched but
/// not yet returned from [`BatchLoader::next_batch`].
pub struct BatchLoader {
    config: LoaderConfig,
    plan: TraversalPlan,
    assembler: Arc<BatchAssembler>,
    pool: WorkerPool,
    summary: PropertiesSummary,
    scaling: PropertiesScaling,
    next_dispatch: u64,
    next_delivery: u64,
    /// Batch order of the most recently dispatched epoch.
    cached_epoch: (usize, Vec<BatchSpec>),
    reorder: BTreeMap<u64, Result<PropertyBatch, LoaderError>>,
    peak_in_flight: usize,
}

impl BatchLoader {
    /// Fresh loader: summarizes the corpus and derives scaling from it.
    pub fn new(
        corpus: Arc<dyn PropertyCorpus>,
        truth: &TruthSet,
        config: LoaderConfig,
    ) -> Result<Self, LoaderError> {
        let summary = corpus.summarize()?;
        let scaling = PropertiesScaling::from_summary(&summary, config.scale_bool_properties);
        Self::with_scaling(corpus, truth, config, summary, scaling)
    }

    /// Loader reusing a previously computed summary and scaling.
    pub fn with_scaling(
        corpus: Arc<dyn PropertyCorpus>,
        truth: &TruthSet,
        config: LoaderConfig,
        summary: PropertiesSummary,
        scaling: PropertiesScaling,
    ) -> Result<Self, LoaderError> {
        config.validate()?;
        let masks = Arc::new(truth.resolve(corpus.as_ref())?);
        let assembler = Arc::new(BatchAssembler::new(
            corpus,
            Arc::clone(&masks),
            &scaling,
            &config,
        )?);
        let rows = assembler.trainable_rows(masks.included_rows())?;
        let plan = TraversalPlan::new(&rows, &config)?;
        let pool = WorkerPool::new(config.num_workers, Arc::clone(&assembler))?;

        tracing::info!(
            training_variants = plan.num_training_variants(),
            validation_variants = plan.num_validation_variants(),
            batches_per_epoch = plan.batches_per_epoch(),
            epochs = plan.num_epochs(),
            features = assembler.num_features(),
            workers = config.num_workers,
            look_ahead = config.max_look_ahead_batches,
            "Batch loader ready"
        );

        Ok(Self {
            config,
            plan,
            assembler,
            pool,
            summary,
            scaling,
            next_dispatch: 0,
            next_delivery: 0,
            cached_epoch: (usize::MAX, Vec::new()),
            reorder: BTreeMap::new(),
            peak_in_flight: 0,
        })
    }

    /// Rebuild the traversal described by `state` and continue after its last
    /// consumed batch.
    pub fn resume(
        corpus: Arc<dyn PropertyCorpus>,
        truth: &TruthSet,
        mut config: LoaderConfig,
        summary: PropertiesSummary,
        scaling: PropertiesScaling,
        state: &LoaderState,
    ) -> Result<Self, LoaderError> {
        if state.format_version != LOADER_STATE_VERSION {
            return Err(LoaderError::Config(format!(
                "unsupported loader state version {} (expected {LOADER_STATE_VERSION})",
                state.format_version
            )));
        }
        if state.random_seed != config.random_seed
            || state.shuffle != config.shuffle
            || state.variants_per_batch != config.variants_per_batch
            || state.keep_multiallelic != config.keep_multiallelic
        {
            tracing::warn!(
                saved_seed = state.random_seed,
                saved_batch = state.variants_per_batch,
                saved_keep_multiallelic = state.keep_multiallelic,
                "Loader settings differ from the checkpoint; using the saved traversal"
            );
            config.random_seed = state.random_seed;
            config.shuffle = state.shuffle;
            config.variants_per_batch = state.variants_per_batch;
            config.keep_multiallelic = state.keep_multiallelic;
        }

        let mut loader = Self::with_scaling(corpus, truth, config, summary, scaling)?;
        if state.batches_consumed > loader.total_batches() {
            return Err(LoaderError::Config(format!(
                "cursor at batch {} but the traversal has only {}",
                state.batches_consumed,
                loader.total_batches()
            )));
        }
        loader.next_dispatch = state.batches_consumed;
        loader.next_delivery = state.batches_consumed;
        tracing::info!(
            batches_consumed = state.batches_consumed,
            remaining = loader.batches_remaining(),
            "Resumed batch loader"
        );
        Ok(loader)
    }

    /// Block until the next batch in traversal order is ready.
    ///
    /// Returns `Ok(None)` once every epoch has been delivered.
    pub fn next_batch(&mut self) -> Result<Option<PropertyBatch>, LoaderError> {
        if self.next_delivery >= self.total_batches() {
            return Ok(None);
        }
        self.fill()?;

        let sequence = self.next_delivery;
        let result = loop {
            if let Some(result) = self.reorder.remove(&sequence) {
                break result;
            }
            let (done, result) = self.pool.recv()?;
            self.reorder.insert(done, result);
        };
        self.next_delivery += 1;
        let batch = result?;

        // keep workers busy while the caller trains on this batch
        self.fill()?;
        Ok(Some(batch))
    }

    fn fill(&mut self) -> Result<(), LoaderError> {
        let total = self.total_batches();
        while self.in_flight() < self.config.max_look_ahead_batches && self.next_dispatch < total {
            let sequence = self.next_dispatch;
            let spec = self.spec_for(sequence);
            self.pool.submit(BatchJob { sequence, spec })?;
            self.next_dispatch += 1;
            self.peak_in_flight = self.peak_in_flight.max(self.in_flight());
        }
        Ok(())
    }

    fn spec_for(&mut self, sequence: u64) -> BatchSpec {
        let per_epoch = self.plan.batches_per_epoch() as u64;
        let epoch = (sequence / per_epoch) as usize;
        let index = (sequence % per_epoch) as usize;
        if self.cached_epoch.0 != epoch {
            self.cached_epoch = (epoch, self.plan.epoch(epoch));
        }
        self.cached_epoch.1[index].clone()
    }

    /// Batches dispatched but not yet returned to the caller.
    pub fn in_flight(&self) -> usize {
        (self.next_dispatch - self.next_delivery) as usize
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    pub fn state(&self) -> LoaderState {
        LoaderState {
            format_version: LOADER_STATE_VERSION,
            random_seed: self.config.random_seed,
            shuffle: self.config.shuffle,
            variants_per_batch: self.config.variants_per_batch,
            keep_multiallelic: self.config.keep_multiallelic,
            batches_consumed: self.next_delivery,
        }
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.plan.batches_per_epoch()
    }

    pub fn total_batches(&self) -> u64 {
        self.plan.total_batches()
    }

    pub fn batches_remaining(&self) -> u64 {
        self.total_batches().saturating_sub(self.next_delivery)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn num_samples(&self) -> usize {
        self.assembler.num_samples()
    }

    /// Number of properties in each genotype's input vector.
    pub fn num_properties(&self) -> usize {
        self.assembler.num_features()
    }

    pub fn feature_names(&self) -> &[String] {
        self.assembler.feature_names()
    }

    pub fn properties_summary(&self) -> &PropertiesSummary {
        &self.summary
    }

    pub fn properties_scaling(&self) -> &PropertiesScaling {
        &self.scaling
    }
}

impl Iterator for BatchLoader {
    type Item = Result<PropertyBatch, LoaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}
