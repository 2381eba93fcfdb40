//! Writes property corpora to long-layout Parquet files using Arrow.

use crate::corpus::{
    PropertyCorpus, COPY_NUMBER_COLUMN, ID_COLUMN, SAMPLE_COLUMN, WEIGHT_COLUMN,
};
use crate::types::LoaderError;
use arrow::array::*;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::path::PathBuf;
use std::sync::Arc;

/// Arrow schema for a corpus with the given properties.
pub fn corpus_schema(
    property_names: &[String],
    bool_properties: &[bool],
    with_copy_number: bool,
) -> Schema {
    let mut fields = vec![
        Field::new(ID_COLUMN, DataType::Utf8, false),
        Field::new(SAMPLE_COLUMN, DataType::Utf8, false),
        Field::new(WEIGHT_COLUMN, DataType::Float32, false),
    ];
    if with_copy_number {
        fields.push(Field::new(COPY_NUMBER_COLUMN, DataType::Float32, false));
    }
    for (name, &is_bool) in property_names.iter().zip(bool_properties) {
        let dt = if is_bool {
            DataType::Boolean
        } else {
            DataType::Float32
        };
        fields.push(Field::new(name, dt, true));
    }
    Schema::new(fields)
}

/// One variant's rows: `properties` is `samples × properties`, `NaN` for missing.
#[derive(Debug, Clone)]
pub struct VariantRecord {
    pub id: String,
    pub weight: f32,
    pub expected_copy_number: Option<Vec<f32>>,
    pub properties: Vec<f32>,
}

/// Buffers variant records and writes them to a Parquet file.
pub struct CorpusWriter {
    output_path: PathBuf,
    sample_ids: Vec<String>,
    property_names: Vec<String>,
    bool_properties: Vec<bool>,
    records: Vec<VariantRecord>,
    max_row_group_size: Option<usize>,
}

impl CorpusWriter {
    pub fn new(output_path: PathBuf, sample_ids: Vec<String>, property_names: Vec<String>) -> Self {
        let bool_properties = vec![false; property_names.len()];
        Self {
            output_path,
            sample_ids,
            property_names,
            bool_properties,
            records: Vec::new(),
            max_row_group_size: None,
        }
    }

    /// Store the named properties as Boolean columns.
    pub fn with_bool_properties(mut self, names: &[&str]) -> Self {
        for (flag, name) in self.bool_properties.iter_mut().zip(&self.property_names) {
            *flag = names.contains(&name.as_str());
        }
        self
    }

    pub fn with_max_row_group_size(mut self, rows: usize) -> Self {
        self.max_row_group_size = Some(rows);
        self
    }

    pub fn record(&mut self, record: VariantRecord) {
        self.records.push(record);
    }

    /// Copy every variant of another corpus.
    pub fn record_corpus(&mut self, corpus: &dyn PropertyCorpus) -> Result<(), LoaderError> {
        let rows: Vec<usize> = (0..corpus.num_variants()).collect();
        let block = corpus.read_variants(&rows)?;
        let ns = block.num_samples;
        let np = block.num_properties;
        for (i, row) in rows.iter().enumerate() {
            self.records.push(VariantRecord {
                id: corpus.variant_ids()[*row].clone(),
                weight: block.variant_weights[i],
                expected_copy_number: block
                    .expected_copy_number
                    .as_ref()
                    .map(|c| c[i * ns..(i + 1) * ns].to_vec()),
                properties: block.properties[i * ns * np..(i + 1) * ns * np].to_vec(),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write all buffered records and return the output path.
    pub fn finish(self) -> Result<PathBuf, LoaderError> {
        let with_copy_number = self
            .records
            .iter()
            .any(|r| r.expected_copy_number.is_some());
        let schema = Arc::new(corpus_schema(
            &self.property_names,
            &self.bool_properties,
            with_copy_number,
        ));
        let batch = self.build_record_batch(schema.clone(), with_copy_number)?;

        let props = self.max_row_group_size.map(|rows| {
            WriterProperties::builder()
                .set_max_row_group_size(rows)
                .build()
        });
        let file = std::fs::File::create(&self.output_path)?;
        let mut writer = ArrowWriter::try_new(file, schema, props)?;
        writer.write(&batch)?;
        writer.close()?;

        tracing::info!(
            variants = self.records.len(),
            samples = self.sample_ids.len(),
            path = %self.output_path.display(),
            "Wrote property corpus Parquet file"
        );

        Ok(self.output_path)
    }

    fn build_record_batch(
        &self,
        schema: Arc<Schema>,
        with_copy_number: bool,
    ) -> Result<RecordBatch, LoaderError> {
        let ns = self.sample_ids.len();
        let np = self.property_names.len();
        for r in &self.records {
            if r.properties.len() != ns * np {
                return Err(LoaderError::Corpus(format!(
                    "variant {} has {} property values, expected {}",
                    r.id,
                    r.properties.len(),
                    ns * np
                )));
            }
            if r.expected_copy_number.as_ref().is_some_and(|c| c.len() != ns) {
                return Err(LoaderError::Corpus(format!(
                    "variant {} copy numbers do not match {ns} samples",
                    r.id
                )));
            }
        }

        let ids: StringArray = self
            .records
            .iter()
            .flat_map(|r| std::iter::repeat(Some(r.id.as_str())).take(ns))
            .collect();
        let samples: StringArray = self
            .records
            .iter()
            .flat_map(|_| self.sample_ids.iter().map(|s| Some(s.as_str())))
            .collect();
        let weights: Float32Array = self
            .records
            .iter()
            .flat_map(|r| std::iter::repeat(Some(r.weight)).take(ns))
            .collect();

        let mut columns: Vec<Arc<dyn Array>> =
            vec![Arc::new(ids), Arc::new(samples), Arc::new(weights)];
        if with_copy_number {
            let copy_number: Float32Array = self
                .records
                .iter()
                .flat_map(|r| match &r.expected_copy_number {
                    Some(c) => c.clone(),
                    None => vec![crate::corpus::DEFAULT_COPY_NUMBER; ns],
                })
                .map(Some)
                .collect();
            columns.push(Arc::new(copy_number));
        }

        for (p, &is_bool) in self.bool_properties.iter().enumerate() {
            let values = self
                .records
                .iter()
                .flat_map(|r| (0..ns).map(move |s| r.properties[s * np + p]));
            if is_bool {
                let array: BooleanArray = values
                    .map(|x| (!x.is_nan()).then_some(x != 0.0))
                    .collect();
                columns.push(Arc::new(array));
            } else {
                let array: Float32Array = values.map(|x| (!x.is_nan()).then_some(x)).collect();
                columns.push(Arc::new(array));
            }
        }

        Ok(RecordBatch::try_new(schema, columns)?)
    }
}
