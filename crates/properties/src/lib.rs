//! Streaming access to per-genotype variant properties for GQ recalibration.
//!
//! Reads a property corpus (Parquet or any [`PropertyCorpus`]), joins it with
//! partial truth labels, and streams scaled [`PropertyBatch`]es produced by a
//! pool of worker threads.

pub mod assemble;
pub mod config;
pub mod corpus;
pub mod loader;
pub mod mocks;
pub mod plan;
pub mod pool;
pub mod scaling;
pub mod truth;
pub mod types;
pub mod writer;

pub use config::LoaderConfig;
pub use corpus::{ParquetPropertyCorpus, PropertyCorpus};
pub use loader::{BatchLoader, LoaderState};
pub use scaling::{PropertiesScaling, PropertiesSummary, PropertyScaling, PropertySummary};
pub use truth::{TruthSet, VariantTruth};
pub use types::{BatchKind, LoaderError, PropertyBatch, VariantBlock};
pub use writer::{CorpusWriter, VariantRecord};
