//! Generate a synthetic property corpus and truth JSON for trying out `gq-recal train`.
//!
//! Usage: cargo run -p recal-core --example gen_synthetic_corpus -- data/synthetic [num_variants] [num_samples]

use std::path::PathBuf;

use properties::mocks::{truth_for_all, InMemoryCorpus};
use properties::{CorpusWriter, PropertyCorpus};

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let dir = PathBuf::from(args.next().unwrap_or_else(|| "data/synthetic".to_string()));
    let num_variants: usize = args.next().map(|s| s.parse()).transpose()?.unwrap_or(2_000);
    let num_samples: usize = args.next().map(|s| s.parse()).transpose()?.unwrap_or(20);
    std::fs::create_dir_all(&dir)?;

    let corpus = InMemoryCorpus::synthetic(
        num_variants,
        num_samples,
        &["GQ", "PE_GQ", "SR_GQ", "RD_CN", "allele_count"],
        42,
    );

    let properties = dir.join("properties.parquet");
    let mut writer = CorpusWriter::new(
        properties.clone(),
        corpus.sample_ids().to_vec(),
        corpus.property_names().to_vec(),
    );
    writer.record_corpus(&corpus)?;
    writer.finish()?;

    let truth = dir.join("truth.json");
    std::fs::write(&truth, serde_json::to_string_pretty(&truth_for_all(&corpus))?)?;

    println!("Wrote {num_variants} variants x {num_samples} samples:");
    println!("  {}", properties.display());
    println!("  {}", truth.display());
    Ok(())
}
