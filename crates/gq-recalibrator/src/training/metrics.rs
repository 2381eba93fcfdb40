//! Loss accumulators: per-batch values grouped into mini-epochs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Append-only per-batch values, partitioned into consecutive mini-epochs.
///
/// `mini_epoch_starts[i]` is the index of the first value of mini-epoch `i`;
/// the current mini-epoch is the last one. Starts begin at 0, never decrease
/// and never pass `values.len()`; decoding rejects anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BatchLossesRecord")]
pub struct BatchLosses {
    values: Vec<f64>,
    mini_epoch_starts: Vec<usize>,
}

#[derive(Deserialize)]
struct BatchLossesRecord {
    values: Vec<f64>,
    mini_epoch_starts: Vec<usize>,
}

impl TryFrom<BatchLossesRecord> for BatchLosses {
    type Error = String;

    fn try_from(record: BatchLossesRecord) -> Result<Self, Self::Error> {
        let BatchLossesRecord {
            values,
            mini_epoch_starts,
        } = record;
        if mini_epoch_starts.first() != Some(&0) {
            return Err("mini-epoch boundaries must start at 0".to_string());
        }
        if mini_epoch_starts.windows(2).any(|w| w[1] < w[0]) {
            return Err(format!("mini-epoch boundaries are not sorted: {mini_epoch_starts:?}"));
        }
        if let Some(&last) = mini_epoch_starts.last() {
            if last > values.len() {
                return Err(format!(
                    "mini-epoch boundary {last} is past the {} recorded values",
                    values.len()
                ));
            }
        }
        Ok(Self {
            values,
            mini_epoch_starts,
        })
    }
}

impl Default for BatchLosses {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            mini_epoch_starts: vec![0],
        }
    }
}

impl BatchLosses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn current_start(&self) -> usize {
        self.mini_epoch_starts.last().copied().unwrap_or(0)
    }

    /// Values appended since the current mini-epoch began.
    pub fn num_mini_epoch_batches(&self) -> usize {
        self.values.len() - self.current_start()
    }

    /// Mean of the current mini-epoch, `NaN` when it has no values yet.
    pub fn mini_epoch_mean(&self) -> f64 {
        let current = &self.values[self.current_start()..];
        if current.is_empty() {
            f64::NAN
        } else {
            current.iter().sum::<f64>() / current.len() as f64
        }
    }

    /// Start a new mini-epoch. Earlier values are kept.
    pub fn next_mini_epoch(&mut self) {
        self.mini_epoch_starts.push(self.values.len());
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn mini_epoch_starts(&self) -> &[usize] {
        &self.mini_epoch_starts
    }

    pub fn num_mini_epochs(&self) -> usize {
        self.mini_epoch_starts.len()
    }

    /// Mean of every completed or current mini-epoch that has values.
    pub fn mini_epoch_means(&self) -> Vec<f64> {
        let mut bounds = self.mini_epoch_starts.clone();
        bounds.push(self.values.len());
        bounds
            .windows(2)
            .filter(|w| w[1] > w[0])
            .map(|w| {
                let slice = &self.values[w[0]..w[1]];
                slice.iter().sum::<f64>() / slice.len() as f64
            })
            .collect()
    }
}

/// Training or validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Training,
    Validation,
}

/// One of the six tracked loss series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossSeries {
    TrainingLoss,
    TrainingTruthAgreement,
    TrainingGqCorrelation,
    ValidationLoss,
    ValidationTruthAgreement,
    ValidationGqCorrelation,
}

impl LossSeries {
    pub const ALL: [Self; 6] = [
        Self::TrainingLoss,
        Self::TrainingTruthAgreement,
        Self::TrainingGqCorrelation,
        Self::ValidationLoss,
        Self::ValidationTruthAgreement,
        Self::ValidationGqCorrelation,
    ];

    /// `(loss, truth_agreement, gq_correlation)` series for a phase.
    pub fn for_phase(phase: Phase) -> [Self; 3] {
        match phase {
            Phase::Training => [
                Self::TrainingLoss,
                Self::TrainingTruthAgreement,
                Self::TrainingGqCorrelation,
            ],
            Phase::Validation => [
                Self::ValidationLoss,
                Self::ValidationTruthAgreement,
                Self::ValidationGqCorrelation,
            ],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TrainingLoss => "training_loss",
            Self::TrainingTruthAgreement => "training_truth_agreement",
            Self::TrainingGqCorrelation => "training_gq_correlation",
            Self::ValidationLoss => "validation_loss",
            Self::ValidationTruthAgreement => "validation_truth_agreement",
            Self::ValidationGqCorrelation => "validation_gq_correlation",
        }
    }
}

impl fmt::Display for LossSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-batch values for one step, in phase-series order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    pub loss: f64,
    pub truth_agreement: f64,
    pub gq_correlation: f64,
}

/// The six loss series, keyed by [`LossSeries`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<LossSeries, BatchLosses>",
    into = "BTreeMap<LossSeries, BatchLosses>"
)]
pub struct LossHistory {
    series: BTreeMap<LossSeries, BatchLosses>,
}

impl Default for LossHistory {
    fn default() -> Self {
        Self {
            series: LossSeries::ALL
                .into_iter()
                .map(|s| (s, BatchLosses::new()))
                .collect(),
        }
    }
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, series: LossSeries) -> &BatchLosses {
        // every series exists: both construction paths insert all six
        &self.series[&series]
    }

    pub fn append(&mut self, phase: Phase, step: StepLosses) {
        let [loss, agreement, correlation] = LossSeries::for_phase(phase);
        self.series_mut(loss).append(step.loss);
        self.series_mut(agreement).append(step.truth_agreement);
        self.series_mut(correlation).append(step.gq_correlation);
    }

    pub fn next_mini_epoch(&mut self) {
        for losses in self.series.values_mut() {
            losses.next_mini_epoch();
        }
    }

    /// Current mini-epoch mean of every series.
    pub fn mini_epoch_means(&self) -> BTreeMap<LossSeries, f64> {
        self.series
            .iter()
            .map(|(k, v)| (*k, v.mini_epoch_mean()))
            .collect()
    }

    pub fn num_batches(&self, phase: Phase) -> usize {
        self.get(LossSeries::for_phase(phase)[0]).len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LossSeries, &BatchLosses)> {
        self.series.iter().map(|(k, v)| (*k, v))
    }

    fn series_mut(&mut self, series: LossSeries) -> &mut BatchLosses {
        self.series.entry(series).or_default()
    }
}

impl From<BTreeMap<LossSeries, BatchLosses>> for LossHistory {
    fn from(mut series: BTreeMap<LossSeries, BatchLosses>) -> Self {
        for s in LossSeries::ALL {
            series.entry(s).or_default();
        }
        Self { series }
    }
}

impl From<LossHistory> for BTreeMap<LossSeries, BatchLosses> {
    fn from(history: LossHistory) -> Self {
        history.series
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_bad_boundaries() {
        for json in [
            r#"{"values":[1.0],"mini_epoch_starts":[0,3]}"#,
            r#"{"values":[1.0,2.0],"mini_epoch_starts":[0,2,1]}"#,
            r#"{"values":[1.0],"mini_epoch_starts":[]}"#,
            r#"{"values":[1.0],"mini_epoch_starts":[1]}"#,
        ] {
            assert!(serde_json::from_str::<BatchLosses>(json).is_err(), "{json}");
        }

        let ok: BatchLosses =
            serde_json::from_str(r#"{"values":[1.0,3.0],"mini_epoch_starts":[0,2,2]}"#).unwrap();
        assert_eq!(ok.num_mini_epoch_batches(), 0);
        assert_eq!(ok.mini_epoch_means(), vec![2.0]);
    }

    #[test]
    fn test_mini_epoch_partitioning() {
        let mut losses = BatchLosses::new();
        assert!(losses.mini_epoch_mean().is_nan());
        losses.append(1.0);
        losses.append(3.0);
        assert_eq!(losses.num_mini_epoch_batches(), 2);
        assert!((losses.mini_epoch_mean() - 2.0).abs() < 1e-12);

        losses.next_mini_epoch();
        assert_eq!(losses.num_mini_epoch_batches(), 0);
        assert_eq!(losses.len(), 2);
        losses.append(10.0);
        assert!((losses.mini_epoch_mean() - 10.0).abs() < 1e-12);
        assert_eq!(losses.values(), &[1.0, 3.0, 10.0]);
        assert_eq!(losses.mini_epoch_starts(), &[0, 2]);
        assert_eq!(losses.mini_epoch_means(), vec![2.0, 10.0]);
    }

    #[test]
    fn test_empty_mini_epochs_skipped_in_means() {
        let mut losses = BatchLosses::new();
        losses.next_mini_epoch();
        losses.append(4.0);
        losses.next_mini_epoch();
        assert_eq!(losses.num_mini_epochs(), 3);
        assert_eq!(losses.mini_epoch_means(), vec![4.0]);
    }

    #[test]
    fn test_history_append_by_phase() {
        let mut history = LossHistory::new();
        history.append(
            Phase::Training,
            StepLosses {
                loss: 0.5,
                truth_agreement: 0.3,
                gq_correlation: 0.6,
            },
        );
        history.append(
            Phase::Validation,
            StepLosses {
                loss: 0.7,
                truth_agreement: 0.4,
                gq_correlation: 0.2,
            },
        );
        assert_eq!(history.num_batches(Phase::Training), 1);
        assert_eq!(history.get(LossSeries::TrainingGqCorrelation).values(), &[0.6]);
        assert_eq!(history.get(LossSeries::ValidationTruthAgreement).values(), &[0.4]);

        history.next_mini_epoch();
        for (_, losses) in history.iter() {
            assert_eq!(losses.num_mini_epochs(), 2);
        }
        assert!(history.mini_epoch_means().values().all(|m| m.is_nan()));
    }

    #[test]
    fn test_history_json_keys() {
        let mut history = LossHistory::new();
        history.append(
            Phase::Training,
            StepLosses {
                loss: 1.0,
                truth_agreement: 0.5,
                gq_correlation: 0.0,
            },
        );
        let json = serde_json::to_string(&history).unwrap();
        assert!(json.contains("\"training_truth_agreement\""));
        let back: LossHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, history);
    }

    #[test]
    fn test_history_missing_series_filled() {
        let back: LossHistory = serde_json::from_str(
            r#"{"training_loss": {"values": [1.0], "mini_epoch_starts": [0]}}"#,
        )
        .unwrap();
        assert_eq!(back.get(LossSeries::TrainingLoss).values(), &[1.0]);
        assert!(back.get(LossSeries::ValidationGqCorrelation).is_empty());
    }
}
