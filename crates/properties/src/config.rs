use crate::types::LoaderError;

/// Batch loader configuration, usually the `[loader]` section of the training TOML.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoaderConfig {
    /// Number of variants in each training or validation batch.
    #[serde(default = "default_variants_per_batch")]
    pub variants_per_batch: usize,

    /// Shuffle variant order within each epoch.
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,

    /// Seed for the training/validation split and per-epoch shuffles.
    #[serde(default)]
    pub random_seed: u64,

    /// Fraction of labeled variants held out for validation.
    #[serde(default = "default_validation_proportion")]
    pub validation_proportion: f64,

    /// Number of passes over the training variants.
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,

    /// Properties never used as predictor inputs.
    #[serde(default)]
    pub excluded_properties: Vec<String>,

    /// Z-score boolean properties too (otherwise they stay 0.0 / 1.0).
    #[serde(default)]
    pub scale_bool_properties: bool,

    /// Number of worker threads preparing batches.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Maximum number of dispatched but unconsumed batches.
    #[serde(default = "default_max_look_ahead_batches")]
    pub max_look_ahead_batches: usize,

    /// Property whose scaled value is the correlation target.
    #[serde(default = "default_target_property")]
    pub target_property: String,

    /// Treat every HOMREF genotype as known-good.
    #[serde(default)]
    pub keep_homref: bool,

    /// Treat every HOMVAR genotype as known-good.
    #[serde(default)]
    pub keep_homvar: bool,

    /// Train on multiallelic variants. When off, variants with a nonzero
    /// [`MULTIALLELIC_PROPERTY`] are left out of the traversal.
    #[serde(default = "default_keep_multiallelic")]
    pub keep_multiallelic: bool,
}

/// Property holding the per-genotype alt allele count, used by `keep_homref` / `keep_homvar`.
pub const ALLELE_COUNT_PROPERTY: &str = "allele_count";

/// Property flagging multiallelic variants, used when `keep_multiallelic` is off.
pub const MULTIALLELIC_PROPERTY: &str = "is_multiallelic";

fn default_variants_per_batch() -> usize {
    100
}
fn default_shuffle() -> bool {
    true
}
fn default_validation_proportion() -> f64 {
    0.2
}
fn default_num_epochs() -> usize {
    1
}
fn default_num_workers() -> usize {
    4
}
fn default_max_look_ahead_batches() -> usize {
    3
}
fn default_target_property() -> String {
    "GQ".to_string()
}
fn default_keep_multiallelic() -> bool {
    true
}

impl LoaderConfig {
    /// Reject settings the loader cannot run with.
    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.variants_per_batch == 0 {
            return Err(LoaderError::Config("variants_per_batch must be at least 1".into()));
        }
        if self.num_epochs == 0 {
            return Err(LoaderError::Config("num_epochs must be at least 1".into()));
        }
        if self.num_workers == 0 {
            return Err(LoaderError::Config("num_workers must be at least 1".into()));
        }
        if self.max_look_ahead_batches == 0 {
            return Err(LoaderError::Config(
                "max_look_ahead_batches must be at least 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_proportion) {
            return Err(LoaderError::Config(format!(
                "validation_proportion must be in [0, 1), got {}",
                self.validation_proportion
            )));
        }
        Ok(())
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            variants_per_batch: default_variants_per_batch(),
            shuffle: default_shuffle(),
            random_seed: 0,
            validation_proportion: default_validation_proportion(),
            num_epochs: default_num_epochs(),
            excluded_properties: Vec::new(),
            scale_bool_properties: false,
            num_workers: default_num_workers(),
            max_look_ahead_batches: default_max_look_ahead_batches(),
            target_property: default_target_property(),
            keep_homref: false,
            keep_homvar: false,
            keep_multiallelic: default_keep_multiallelic(),
        }
    }
}
