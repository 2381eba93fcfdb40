//! Random access to per-variant, per-sample properties.
//!
//! The Parquet layout is "long": one row per (variant, sample) pair, rows of
//! a variant contiguous, and every variant listing the samples in the same
//! order. Structural columns are [`ID_COLUMN`], [`SAMPLE_COLUMN`], and the
//! optional [`WEIGHT_COLUMN`] / [`COPY_NUMBER_COLUMN`]; every other numeric or
//! boolean column is a property.

use crate::scaling::{PropertiesSummary, SummaryAccumulator};
use crate::types::{LoaderError, VariantBlock};
use arrow::array::*;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReaderBuilder, RowSelection, RowSelector};
use parquet::arrow::ProjectionMask;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub const ID_COLUMN: &str = "id";
pub const SAMPLE_COLUMN: &str = "sample";
pub const WEIGHT_COLUMN: &str = "variant_weights";
pub const COPY_NUMBER_COLUMN: &str = "expected_copy_number";

/// Expected copy number assumed when the corpus has no copy-number column.
pub const DEFAULT_COPY_NUMBER: f32 = 2.0;

/// Variants per read while summarizing a corpus.
const SUMMARY_CHUNK_VARIANTS: usize = 1024;

/// Indexed store of variant properties.
///
/// Implementations must be shareable across worker threads; `read_variants`
/// is called concurrently.
pub trait PropertyCorpus: Send + Sync {
    fn variant_ids(&self) -> &[String];
    fn sample_ids(&self) -> &[String];
    fn property_names(&self) -> &[String];
    /// Parallel to `property_names`: true for boolean columns.
    fn bool_properties(&self) -> &[bool];

    /// Read raw values for the given variant rows, in the order requested.
    fn read_variants(&self, rows: &[usize]) -> Result<VariantBlock, LoaderError>;

    fn num_variants(&self) -> usize {
        self.variant_ids().len()
    }

    fn num_samples(&self) -> usize {
        self.sample_ids().len()
    }

    fn property_index(&self, name: &str) -> Option<usize> {
        self.property_names().iter().position(|p| p == name)
    }

    /// Stream the whole corpus once and summarize every property.
    fn summarize(&self) -> Result<PropertiesSummary, LoaderError> {
        let mut acc = SummaryAccumulator::new(self.property_names(), self.bool_properties());
        let rows: Vec<usize> = (0..self.num_variants()).collect();
        for chunk in rows.chunks(SUMMARY_CHUNK_VARIANTS) {
            acc.add_block(&self.read_variants(chunk)?);
        }
        let summary = acc.finish();
        tracing::info!(
            variants = self.num_variants(),
            samples = self.num_samples(),
            properties = summary.len(),
            "Summarized corpus properties"
        );
        Ok(summary)
    }
}

/// [`PropertyCorpus`] backed by a long-layout Parquet file.
///
/// Opening scans only the `id` and `sample` columns to build the index; each
/// `read_variants` call reopens the file and decodes only the selected rows.
pub struct ParquetPropertyCorpus {
    path: PathBuf,
    variant_ids: Vec<String>,
    sample_ids: Vec<String>,
    property_names: Vec<String>,
    bool_properties: Vec<bool>,
    has_weights: bool,
    has_copy_number: bool,
}

impl ParquetPropertyCorpus {
    pub fn open(path: &Path) -> Result<Self, LoaderError> {
        let file = std::fs::File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = builder.schema().clone();

        let mut property_names = Vec::new();
        let mut bool_properties = Vec::new();
        let mut has_weights = false;
        let mut has_copy_number = false;
        for field in schema.fields() {
            match field.name().as_str() {
                ID_COLUMN | SAMPLE_COLUMN => {
                    if field.data_type() != &DataType::Utf8 {
                        return Err(LoaderError::Corpus(format!(
                            "column {} must be Utf8, found {}",
                            field.name(),
                            field.data_type()
                        )));
                    }
                }
                WEIGHT_COLUMN => has_weights = true,
                COPY_NUMBER_COLUMN => has_copy_number = true,
                name => {
                    let dt = field.data_type();
                    if dt == &DataType::Boolean {
                        bool_properties.push(true);
                    } else if dt.is_numeric() {
                        bool_properties.push(false);
                    } else {
                        return Err(LoaderError::Corpus(format!(
                            "property column {name} has unsupported type {dt}"
                        )));
                    }
                    property_names.push(name.to_string());
                }
            }
        }

        let id_idx = column_index(&schema, ID_COLUMN)?;
        let sample_idx = column_index(&schema, SAMPLE_COLUMN)?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), [id_idx, sample_idx]);
        let reader = builder.with_projection(mask).build()?;

        let mut index = CorpusIndex::default();
        for batch in reader {
            let batch = batch?;
            let ids = string_column(&batch, ID_COLUMN)?;
            let samples = string_column(&batch, SAMPLE_COLUMN)?;
            for i in 0..batch.num_rows() {
                index.push(ids.value(i), samples.value(i))?;
            }
        }
        let (variant_ids, sample_ids) = index.finish()?;

        tracing::info!(
            path = %path.display(),
            variants = variant_ids.len(),
            samples = sample_ids.len(),
            properties = property_names.len(),
            "Opened property corpus"
        );

        Ok(Self {
            path: path.to_path_buf(),
            variant_ids,
            sample_ids,
            property_names,
            bool_properties,
            has_weights,
            has_copy_number,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PropertyCorpus for ParquetPropertyCorpus {
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
        let ns = self.sample_ids.len();
        let np = self.property_names.len();
        if let Some(&bad) = rows.iter().find(|&&r| r >= self.variant_ids.len()) {
            return Err(LoaderError::Corpus(format!(
                "variant row {bad} out of range ({} variants)",
                self.variant_ids.len()
            )));
        }
        if rows.is_empty() {
            return Ok(VariantBlock {
                rows: Vec::new(),
                num_samples: ns,
                num_properties: np,
                properties: Vec::new(),
                variant_weights: Vec::new(),
                expected_copy_number: self.has_copy_number.then(Vec::new),
            });
        }

        // Parquet row selections must be ascending, so read in file order and
        // permute afterwards.
        let mut order = rows.to_vec();
        order.sort_unstable();
        order.dedup();

        let mut selectors = Vec::with_capacity(order.len() * 2);
        let mut next_row = 0usize;
        for &v in &order {
            let start = v * ns;
            if start > next_row {
                selectors.push(RowSelector::skip(start - next_row));
            }
            selectors.push(RowSelector::select(ns));
            next_row = start + ns;
        }

        let file = std::fs::File::open(&self.path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = builder.schema().clone();
        let mut projected = Vec::with_capacity(np + 2);
        for name in &self.property_names {
            projected.push(column_index(&schema, name)?);
        }
        if self.has_weights {
            projected.push(column_index(&schema, WEIGHT_COLUMN)?);
        }
        if self.has_copy_number {
            projected.push(column_index(&schema, COPY_NUMBER_COLUMN)?);
        }
        let mask = ProjectionMask::roots(builder.parquet_schema(), projected);
        let reader = builder
            .with_projection(mask)
            .with_row_selection(RowSelection::from(selectors))
            .build()?;

        let mut sorted_props = Vec::with_capacity(order.len() * ns * np);
        let mut sorted_weights = Vec::with_capacity(order.len() * ns);
        let mut sorted_copy_number = Vec::with_capacity(order.len() * ns);
        for batch in reader {
            let batch = batch?;
            let columns = self
                .property_names
                .iter()
                .map(|name| float_column(&batch, name))
                .collect::<Result<Vec<_>, _>>()?;
            let weights = if self.has_weights {
                Some(float_column(&batch, WEIGHT_COLUMN)?)
            } else {
                None
            };
            let copy_number = if self.has_copy_number {
                Some(float_column(&batch, COPY_NUMBER_COLUMN)?)
            } else {
                None
            };
            for i in 0..batch.num_rows() {
                for col in &columns {
                    sorted_props.push(nullable_value(col, i, f32::NAN));
                }
                sorted_weights.push(weights.as_ref().map_or(1.0, |w| nullable_value(w, i, 1.0)));
                sorted_copy_number.push(
                    copy_number
                        .as_ref()
                        .map_or(DEFAULT_COPY_NUMBER, |c| nullable_value(c, i, DEFAULT_COPY_NUMBER)),
                );
            }
        }
        if sorted_weights.len() != order.len() * ns {
            return Err(LoaderError::Corpus(format!(
                "expected {} rows for {} variants, read {}",
                order.len() * ns,
                order.len(),
                sorted_weights.len()
            )));
        }

        let position: HashMap<usize, usize> =
            order.iter().enumerate().map(|(k, &v)| (v, k)).collect();
        let mut properties = Vec::with_capacity(rows.len() * ns * np);
        let mut variant_weights = Vec::with_capacity(rows.len());
        let mut expected_copy_number = Vec::with_capacity(rows.len() * ns);
        for v in rows {
            let k = position[v];
            properties.extend_from_slice(&sorted_props[k * ns * np..(k + 1) * ns * np]);
            // the weight is a per-variant value repeated on every sample row
            variant_weights.push(if ns > 0 { sorted_weights[k * ns] } else { 1.0 });
            expected_copy_number.extend_from_slice(&sorted_copy_number[k * ns..(k + 1) * ns]);
        }

        Ok(VariantBlock {
            rows: rows.to_vec(),
            num_samples: ns,
            num_properties: np,
            properties,
            variant_weights,
            expected_copy_number: self.has_copy_number.then_some(expected_copy_number),
        })
    }
}

/// Builds the variant and sample indices while scanning `(id, sample)` rows.
#[derive(Default)]
struct CorpusIndex {
    variant_ids: Vec<String>,
    seen: HashSet<String>,
    sample_ids: Vec<String>,
    samples_known: bool,
    position: usize,
}

impl CorpusIndex {
    fn push(&mut self, id: &str, sample: &str) -> Result<(), LoaderError> {
        if self.variant_ids.last().map(String::as_str) != Some(id) {
            self.close_group()?;
            if !self.seen.insert(id.to_string()) {
                return Err(LoaderError::Corpus(format!(
                    "rows of variant {id} are not contiguous"
                )));
            }
            self.variant_ids.push(id.to_string());
            self.position = 0;
        }

        if self.samples_known {
            if self.sample_ids.get(self.position).map(String::as_str) != Some(sample) {
                return Err(LoaderError::Corpus(format!(
                    "variant {id}: sample {sample} at position {} breaks the corpus sample order",
                    self.position
                )));
            }
        } else {
            if self.sample_ids.iter().any(|s| s == sample) {
                return Err(LoaderError::Corpus(format!(
                    "variant {id}: duplicate sample {sample}"
                )));
            }
            self.sample_ids.push(sample.to_string());
        }
        self.position += 1;
        Ok(())
    }

    fn close_group(&mut self) -> Result<(), LoaderError> {
        let Some(id) = self.variant_ids.last() else {
            return Ok(());
        };
        if !self.samples_known {
            self.samples_known = true;
        } else if self.position != self.sample_ids.len() {
            return Err(LoaderError::Corpus(format!(
                "variant {id} has {} samples, expected {}",
                self.position,
                self.sample_ids.len()
            )));
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(Vec<String>, Vec<String>), LoaderError> {
        self.close_group()?;
        if self.variant_ids.is_empty() {
            return Err(LoaderError::Corpus("corpus contains no rows".into()));
        }
        Ok((self.variant_ids, self.sample_ids))
    }
}

fn column_index(schema: &arrow::datatypes::Schema, name: &str) -> Result<usize, LoaderError> {
    schema
        .index_of(name)
        .map_err(|_| LoaderError::Corpus(format!("missing column {name}")))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, LoaderError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| LoaderError::Corpus(format!("column {name} is not a StringArray")))
}

/// Any numeric or boolean column, cast to `Float32`.
fn float_column(batch: &RecordBatch, name: &str) -> Result<Float32Array, LoaderError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| LoaderError::Corpus(format!("missing column {name}")))?;
    let cast = arrow::compute::cast(column, &DataType::Float32)?;
    cast.as_any()
        .downcast_ref::<Float32Array>()
        .cloned()
        .ok_or_else(|| LoaderError::Corpus(format!("column {name} did not cast to Float32")))
}

fn nullable_value(array: &Float32Array, i: usize, missing: f32) -> f32 {
    if array.is_null(i) {
        missing
    } else {
        array.value(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_groups_variants() {
        let mut index = CorpusIndex::default();
        for (id, sample) in [("v0", "s0"), ("v0", "s1"), ("v1", "s0"), ("v1", "s1")] {
            index.push(id, sample).unwrap();
        }
        let (variants, samples) = index.finish().unwrap();
        assert_eq!(variants, vec!["v0", "v1"]);
        assert_eq!(samples, vec!["s0", "s1"]);
    }

    #[test]
    fn test_index_rejects_sample_order_change() {
        let mut index = CorpusIndex::default();
        index.push("v0", "s0").unwrap();
        index.push("v0", "s1").unwrap();
        let err = index.push("v1", "s1").unwrap_err();
        assert!(matches!(err, LoaderError::Corpus(_)));
    }

    #[test]
    fn test_index_rejects_short_variant() {
        let mut index = CorpusIndex::default();
        index.push("v0", "s0").unwrap();
        index.push("v0", "s1").unwrap();
        index.push("v1", "s0").unwrap();
        assert!(index.finish().is_err());
    }

    #[test]
    fn test_index_rejects_split_variant() {
        let mut index = CorpusIndex::default();
        index.push("v0", "s0").unwrap();
        index.push("v1", "s0").unwrap();
        assert!(index.push("v0", "s0").is_err());
    }

    #[test]
    fn test_index_rejects_empty_corpus() {
        assert!(CorpusIndex::default().finish().is_err());
    }
}
