//! Per-property statistics and the affine scaling derived from them.

use serde::{Deserialize, Serialize};

use crate::types::VariantBlock;

/// Streaming statistics for one property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySummary {
    pub name: String,
    pub is_bool: bool,
    /// Number of non-missing values seen.
    pub count: u64,
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Statistics for every corpus property, in corpus column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertiesSummary {
    pub properties: Vec<PropertySummary>,
}

impl PropertiesSummary {
    pub fn get(&self, name: &str) -> Option<&PropertySummary> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Welford accumulator over [`VariantBlock`]s, skipping missing (`NaN`) values.
pub struct SummaryAccumulator {
    names: Vec<String>,
    is_bool: Vec<bool>,
    count: Vec<u64>,
    mean: Vec<f64>,
    m2: Vec<f64>,
    min: Vec<f64>,
    max: Vec<f64>,
}

impl SummaryAccumulator {
    pub fn new(names: &[String], is_bool: &[bool]) -> Self {
        let n = names.len();
        Self {
            names: names.to_vec(),
            is_bool: is_bool.to_vec(),
            count: vec![0; n],
            mean: vec![0.0; n],
            m2: vec![0.0; n],
            min: vec![f64::INFINITY; n],
            max: vec![f64::NEG_INFINITY; n],
        }
    }

    pub fn add_block(&mut self, block: &VariantBlock) {
        let np = self.names.len().min(block.num_properties);
        for genotype in block.properties.chunks_exact(block.num_properties.max(1)) {
            for (p, &raw) in genotype.iter().take(np).enumerate() {
                if raw.is_nan() {
                    continue;
                }
                let x = raw as f64;
                self.count[p] += 1;
                let delta = x - self.mean[p];
                self.mean[p] += delta / self.count[p] as f64;
                self.m2[p] += delta * (x - self.mean[p]);
                self.min[p] = self.min[p].min(x);
                self.max[p] = self.max[p].max(x);
            }
        }
    }

    pub fn finish(self) -> PropertiesSummary {
        let properties = (0..self.names.len())
            .map(|p| {
                let count = self.count[p];
                let (std, min, max) = if count == 0 {
                    (0.0, 0.0, 0.0)
                } else {
                    ((self.m2[p] / count as f64).sqrt(), self.min[p], self.max[p])
                };
                PropertySummary {
                    name: self.names[p].clone(),
                    is_bool: self.is_bool[p],
                    count,
                    mean: self.mean[p],
                    std,
                    min,
                    max,
                }
            })
            .collect();
        PropertiesSummary { properties }
    }
}

/// Affine map `(x - baseline) / scale` for one property.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PropertyScaling {
    pub baseline: f32,
    pub scale: f32,
}

impl PropertyScaling {
    pub const IDENTITY: Self = Self {
        baseline: 0.0,
        scale: 1.0,
    };

    /// Scale a raw value; missing values map to 0.
    pub fn apply(&self, raw: f32) -> f32 {
        if raw.is_nan() {
            0.0
        } else {
            (raw - self.baseline) / self.scale
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedScaling {
    pub name: String,
    #[serde(flatten)]
    pub scaling: PropertyScaling,
}

/// Scaling for every summarized property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertiesScaling {
    pub properties: Vec<NamedScaling>,
}

impl PropertiesScaling {
    /// Center on the mean and divide by the standard deviation.
    ///
    /// Properties with a zero or non-finite spread get scale 1. Boolean
    /// properties keep their 0/1 encoding unless `scale_bool_properties`.
    pub fn from_summary(summary: &PropertiesSummary, scale_bool_properties: bool) -> Self {
        let properties = summary
            .properties
            .iter()
            .map(|p| {
                let scaling = if p.is_bool && !scale_bool_properties {
                    PropertyScaling::IDENTITY
                } else {
                    let scale = if p.std.is_finite() && p.std > 0.0 {
                        p.std as f32
                    } else {
                        1.0
                    };
                    let baseline = if p.mean.is_finite() { p.mean as f32 } else { 0.0 };
                    PropertyScaling { baseline, scale }
                };
                NamedScaling {
                    name: p.name.clone(),
                    scaling,
                }
            })
            .collect();
        Self { properties }
    }

    pub fn get(&self, name: &str) -> Option<PropertyScaling> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.scaling)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(values: Vec<f32>, num_properties: usize) -> VariantBlock {
        let genotypes = values.len() / num_properties;
        VariantBlock {
            rows: vec![0],
            num_samples: genotypes,
            num_properties,
            properties: values,
            variant_weights: vec![1.0],
            expected_copy_number: None,
        }
    }

    #[test]
    fn test_summary_matches_direct_computation() {
        let names = vec!["GQ".to_string(), "flag".to_string()];
        let mut acc = SummaryAccumulator::new(&names, &[false, true]);
        acc.add_block(&block(vec![10.0, 1.0, 20.0, 0.0], 2));
        acc.add_block(&block(vec![30.0, 1.0, f32::NAN, 1.0], 2));
        let summary = acc.finish();

        let gq = summary.get("GQ").unwrap();
        assert_eq!(gq.count, 3);
        assert!((gq.mean - 20.0).abs() < 1e-9);
        assert!((gq.std - (200.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert_eq!(gq.min, 10.0);
        assert_eq!(gq.max, 30.0);

        let flag = summary.get("flag").unwrap();
        assert_eq!(flag.count, 4);
        assert!((flag.mean - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_scaling_centers_values() {
        let names = vec!["GQ".to_string()];
        let mut acc = SummaryAccumulator::new(&names, &[false]);
        acc.add_block(&block(vec![0.0, 10.0], 1));
        let scaling = PropertiesScaling::from_summary(&acc.finish(), false);
        let gq = scaling.get("GQ").unwrap();
        assert!((gq.apply(5.0)).abs() < 1e-6);
        assert!((gq.apply(10.0) - 1.0).abs() < 1e-6);
        assert_eq!(gq.apply(f32::NAN), 0.0);
    }

    #[test]
    fn test_degenerate_property_gets_unit_scale() {
        let names = vec!["constant".to_string()];
        let mut acc = SummaryAccumulator::new(&names, &[false]);
        acc.add_block(&block(vec![3.0, 3.0, 3.0], 1));
        let scaling = PropertiesScaling::from_summary(&acc.finish(), false);
        let constant = scaling.get("constant").unwrap();
        assert_eq!(constant.scale, 1.0);
        assert_eq!(constant.apply(3.0), 0.0);
    }

    #[test]
    fn test_bool_properties_unscaled_by_default() {
        let names = vec!["flag".to_string()];
        let mut acc = SummaryAccumulator::new(&names, &[true]);
        acc.add_block(&block(vec![0.0, 1.0, 1.0, 1.0], 1));
        let summary = acc.finish();

        let unscaled = PropertiesScaling::from_summary(&summary, false);
        assert_eq!(unscaled.get("flag"), Some(PropertyScaling::IDENTITY));

        let scaled = PropertiesScaling::from_summary(&summary, true);
        assert_ne!(scaled.get("flag"), Some(PropertyScaling::IDENTITY));
    }

    #[test]
    fn test_empty_property_summary() {
        let names = vec!["never_set".to_string()];
        let mut acc = SummaryAccumulator::new(&names, &[false]);
        acc.add_block(&block(vec![f32::NAN, f32::NAN], 1));
        let summary = acc.finish();
        let p = summary.get("never_set").unwrap();
        assert_eq!(p.count, 0);
        assert_eq!(p.std, 0.0);
    }
}
