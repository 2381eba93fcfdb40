//! Deterministic traversal of the labeled variants.

use crate::config::LoaderConfig;
use crate::types::{BatchKind, LoaderError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Corpus rows making up one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSpec {
    pub kind: BatchKind,
    pub rows: Vec<usize>,
}

/// Train/validation split plus the per-epoch batch order.
///
/// The split is drawn once from `random_seed`. Every epoch reshuffles both
/// sets with a seed derived from `(random_seed, epoch)`, so any epoch's plan
/// can be regenerated without replaying earlier ones.
#[derive(Debug, Clone)]
pub struct TraversalPlan {
    training: Vec<usize>,
    validation: Vec<usize>,
    variants_per_batch: usize,
    shuffle: bool,
    seed: u64,
    num_epochs: usize,
}

impl TraversalPlan {
    pub fn new(included_rows: &[usize], config: &LoaderConfig) -> Result<Self, LoaderError> {
        config.validate()?;
        let mut rows = included_rows.to_vec();
        rows.sort_unstable();
        let mut rng = StdRng::seed_from_u64(config.random_seed);
        rows.shuffle(&mut rng);

        let num_validation = (rows.len() as f64 * config.validation_proportion).round() as usize;
        let num_validation = num_validation.min(rows.len().saturating_sub(1));
        let mut validation = rows[..num_validation].to_vec();
        let mut training = rows[num_validation..].to_vec();
        validation.sort_unstable();
        training.sort_unstable();

        if config.variants_per_batch > training.len() {
            return Err(LoaderError::BatchTooLarge {
                requested: config.variants_per_batch,
                available: training.len(),
            });
        }

        Ok(Self {
            training,
            validation,
            variants_per_batch: config.variants_per_batch,
            shuffle: config.shuffle,
            seed: config.random_seed,
            num_epochs: config.num_epochs,
        })
    }

    pub fn num_training_variants(&self) -> usize {
        self.training.len()
    }

    pub fn num_validation_variants(&self) -> usize {
        self.validation.len()
    }

    pub fn training_batches_per_epoch(&self) -> usize {
        self.training.len().div_ceil(self.variants_per_batch)
    }

    pub fn validation_batches_per_epoch(&self) -> usize {
        self.validation.len().div_ceil(self.variants_per_batch)
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.training_batches_per_epoch() + self.validation_batches_per_epoch()
    }

    pub fn num_epochs(&self) -> usize {
        self.num_epochs
    }

    pub fn total_batches(&self) -> u64 {
        (self.batches_per_epoch() * self.num_epochs) as u64
    }

    /// Batch order for one epoch, validation batches spread evenly among
    /// training batches.
    pub fn epoch(&self, epoch: usize) -> Vec<BatchSpec> {
        let mut training = self.training.clone();
        let mut validation = self.validation.clone();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(epoch_seed(self.seed, epoch));
            training.shuffle(&mut rng);
            validation.shuffle(&mut rng);
        }

        let train_batches = self.chunk(&training, BatchKind::Training);
        let val_batches = self.chunk(&validation, BatchKind::Validation);
        let nt = train_batches.len();
        let nv = val_batches.len();

        let mut out = Vec::with_capacity(nt + nv);
        let mut val_iter = val_batches.into_iter();
        let mut emitted = 0;
        for (i, batch) in train_batches.into_iter().enumerate() {
            out.push(batch);
            let due = (i + 1) * nv / nt.max(1);
            while emitted < due {
                match val_iter.next() {
                    Some(v) => out.push(v),
                    None => break,
                }
                emitted += 1;
            }
        }
        out.extend(val_iter);
        out
    }

    fn chunk(&self, rows: &[usize], kind: BatchKind) -> Vec<BatchSpec> {
        rows.chunks(self.variants_per_batch)
            .map(|c| BatchSpec {
                kind,
                rows: c.to_vec(),
            })
            .collect()
    }
}

fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed ^ (epoch as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config(variants_per_batch: usize, validation_proportion: f64) -> LoaderConfig {
        LoaderConfig {
            variants_per_batch,
            validation_proportion,
            random_seed: 11,
            num_epochs: 2,
            ..LoaderConfig::default()
        }
    }

    #[test]
    fn test_split_is_disjoint_and_complete() {
        let rows: Vec<usize> = (0..50).collect();
        let plan = TraversalPlan::new(&rows, &config(8, 0.2)).unwrap();
        assert_eq!(plan.num_validation_variants(), 10);
        assert_eq!(plan.num_training_variants(), 40);

        let epoch = plan.epoch(0);
        let mut seen = HashSet::new();
        for batch in &epoch {
            for &r in &batch.rows {
                assert!(seen.insert(r), "row {r} appears twice");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[test]
    fn test_batch_counts_and_short_last_batch() {
        let rows: Vec<usize> = (0..23).collect();
        let plan = TraversalPlan::new(&rows, &config(5, 0.0)).unwrap();
        assert_eq!(plan.training_batches_per_epoch(), 5);
        assert_eq!(plan.validation_batches_per_epoch(), 0);
        assert_eq!(plan.total_batches(), 10);
        let epoch = plan.epoch(0);
        assert_eq!(epoch.iter().map(|b| b.rows.len()).sum::<usize>(), 23);
        assert_eq!(epoch.last().unwrap().rows.len(), 3);
    }

    #[test]
    fn test_validation_batches_interleaved() {
        let rows: Vec<usize> = (0..48).collect();
        let plan = TraversalPlan::new(&rows, &config(4, 0.25)).unwrap();
        let kinds: Vec<BatchKind> = plan.epoch(0).iter().map(|b| b.kind).collect();
        assert_eq!(kinds.len(), 12);
        assert_eq!(kinds[0], BatchKind::Training);
        // 1 validation batch after every 3 training batches
        assert_eq!(kinds[3], BatchKind::Validation);
        assert_eq!(kinds[7], BatchKind::Validation);
        assert_eq!(kinds[11], BatchKind::Validation);
        assert_eq!(kinds.iter().filter(|k| **k == BatchKind::Validation).count(), 3);
    }

    #[test]
    fn test_epochs_are_deterministic_and_distinct() {
        let rows: Vec<usize> = (0..30).collect();
        let a = TraversalPlan::new(&rows, &config(3, 0.2)).unwrap();
        let b = TraversalPlan::new(&rows, &config(3, 0.2)).unwrap();
        assert_eq!(a.epoch(1), b.epoch(1));
        assert_ne!(a.epoch(0), a.epoch(1));
    }

    #[test]
    fn test_no_shuffle_keeps_row_order() {
        let rows: Vec<usize> = (0..10).collect();
        let cfg = LoaderConfig {
            shuffle: false,
            ..config(2, 0.0)
        };
        let plan = TraversalPlan::new(&rows, &cfg).unwrap();
        let flat: Vec<usize> = plan.epoch(0).into_iter().flat_map(|b| b.rows).collect();
        assert_eq!(flat, rows);
    }

    #[test]
    fn test_batch_larger_than_training_split() {
        let rows: Vec<usize> = (0..10).collect();
        let err = TraversalPlan::new(&rows, &config(9, 0.2)).unwrap_err();
        assert!(matches!(
            err,
            LoaderError::BatchTooLarge {
                requested: 9,
                available: 8
            }
        ));
    }
}
