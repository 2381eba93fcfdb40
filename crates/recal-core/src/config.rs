//! TOML config loading for `gq-recal train`.
//!
//! The file has optional `[loader]`, `[training]` and `[network]` sections
//! plus a top-level `device`. Every field is optional; values are layered as
//! built-in defaults < TOML < command-line flags.

use std::path::Path;

use gq_recalibrator::{DeviceKind, GqRecalibratorConfig, Nonlinearity, TrainingConfig};
use properties::LoaderConfig;
use serde::Deserialize;

/// Top-level structure of a training config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainToml {
    pub device: Option<DeviceKind>,
    #[serde(default)]
    pub loader: LoaderOverrides,
    #[serde(default)]
    pub training: TrainingOverrides,
    #[serde(default)]
    pub network: NetworkOverrides,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoaderOverrides {
    pub variants_per_batch: Option<usize>,
    pub shuffle: Option<bool>,
    pub random_seed: Option<u64>,
    pub validation_proportion: Option<f64>,
    pub num_epochs: Option<usize>,
    pub excluded_properties: Option<Vec<String>>,
    pub scale_bool_properties: Option<bool>,
    pub num_workers: Option<usize>,
    pub max_look_ahead_batches: Option<usize>,
    pub target_property: Option<String>,
    pub keep_homref: Option<bool>,
    pub keep_homvar: Option<bool>,
    pub keep_multiallelic: Option<bool>,
}

/// Gradient bounds of zero or below disable that clipping stage.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingOverrides {
    pub batches_per_mini_epoch: Option<usize>,
    pub max_train_variants: Option<u64>,
    pub learning_rate: Option<f64>,
    pub weight_decay: Option<f64>,
    pub max_gradient_value: Option<f64>,
    pub max_gradient_norm: Option<f64>,
    pub correlation_loss_weight: Option<f64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkOverrides {
    pub num_hidden_layers: Option<usize>,
    pub layer_expansion_factor: Option<f64>,
    pub bias: Option<bool>,
    pub hidden_nonlinearity: Option<Nonlinearity>,
}

/// Fully resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub device: DeviceKind,
    pub loader: LoaderConfig,
    pub training: TrainingConfig,
    /// `num_input_properties` is filled in from the corpus.
    pub network: GqRecalibratorConfig,
}

/// Load and deserialize a `TrainToml` from a TOML file.
pub fn load_train_toml(path: &Path) -> anyhow::Result<TrainToml> {
    let contents = std::fs::read_to_string(path)?;
    let config: TrainToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded training config");
    Ok(config)
}

macro_rules! apply {
    ($target:expr, $source:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(v) = &$source.$field {
                $target.$field = v.clone();
            }
        )+
    };
}

impl LoaderOverrides {
    pub fn apply(&self, config: &mut LoaderConfig) {
        apply!(
            config,
            self,
            variants_per_batch,
            shuffle,
            random_seed,
            validation_proportion,
            num_epochs,
            excluded_properties,
            scale_bool_properties,
            num_workers,
            max_look_ahead_batches,
            target_property,
            keep_homref,
            keep_homvar,
            keep_multiallelic,
        );
    }
}

impl TrainingOverrides {
    pub fn apply(&self, config: &mut TrainingConfig) {
        apply!(
            config,
            self,
            batches_per_mini_epoch,
            learning_rate,
            weight_decay,
            correlation_loss_weight,
        );
        if let Some(n) = self.max_train_variants {
            config.max_train_variants = Some(n);
        }
        if let Some(v) = self.max_gradient_value {
            config.max_gradient_value = positive(v);
        }
        if let Some(v) = self.max_gradient_norm {
            config.max_gradient_norm = positive(v);
        }
    }
}

impl NetworkOverrides {
    pub fn apply(&self, config: &mut GqRecalibratorConfig) {
        apply!(
            config,
            self,
            num_hidden_layers,
            layer_expansion_factor,
            bias,
            hidden_nonlinearity,
        );
    }
}

fn positive(v: f64) -> Option<f64> {
    (v > 0.0).then_some(v)
}

/// Layer `file` then `cli` over the built-in defaults.
pub fn resolve(file: &TrainToml, cli: &TrainToml) -> ResolvedConfig {
    let mut loader = LoaderConfig::default();
    let mut training = TrainingConfig::new();
    let mut network = GqRecalibratorConfig::new(0);
    for layer in [file, cli] {
        layer.loader.apply(&mut loader);
        layer.training.apply(&mut training);
        layer.network.apply(&mut network);
    }
    let device = cli.device.or(file.device).unwrap_or_default();
    ResolvedConfig {
        device,
        loader,
        training,
        network,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_full_train_toml() {
        let toml_str = r#"
device = "cpu"

[loader]
variants_per_batch = 250
shuffle = false
random_seed = 7
validation_proportion = 0.1
num_epochs = 3
excluded_properties = ["SVLEN", "AC"]
num_workers = 8
target_property = "GQ"
keep_homref = true
keep_multiallelic = false

[training]
batches_per_mini_epoch = 20
max_train_variants = 100000
learning_rate = 5e-4
max_gradient_norm = 0

[network]
num_hidden_layers = 4
layer_expansion_factor = 1.5
hidden_nonlinearity = "gelu"
"#;
        let config: TrainToml = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device, Some(DeviceKind::Cpu));
        assert_eq!(config.loader.variants_per_batch, Some(250));
        assert_eq!(config.loader.excluded_properties.as_ref().unwrap().len(), 2);
        assert_eq!(config.training.max_gradient_norm, Some(0.0));
        assert_eq!(config.network.hidden_nonlinearity, Some(Nonlinearity::Gelu));

        let resolved = resolve(&config, &TrainToml::default());
        assert_eq!(resolved.loader.variants_per_batch, 250);
        assert!(!resolved.loader.shuffle);
        assert!(resolved.loader.keep_homref);
        assert!(!resolved.loader.keep_homvar);
        assert!(!resolved.loader.keep_multiallelic);
        assert_eq!(resolved.training.max_train_variants, Some(100_000));
        assert_eq!(resolved.training.max_gradient_norm, None);
        assert_eq!(resolved.training.max_gradient_value, Some(1e-2));
        assert_eq!(resolved.network.num_hidden_layers, 4);
        assert!(resolved.network.bias);
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config: TrainToml = toml::from_str("").unwrap();
        let resolved = resolve(&config, &TrainToml::default());
        assert_eq!(resolved.device, DeviceKind::Cpu);
        assert_eq!(resolved.loader.variants_per_batch, 100);
        assert_eq!(resolved.training.batches_per_mini_epoch, 50);
        assert_eq!(resolved.network.num_hidden_layers, 3);
        assert_eq!(resolved.network.hidden_nonlinearity, Nonlinearity::Silu);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let config: TrainToml =
            toml::from_str(include_str!("../../../configs/train.toml")).unwrap();
        let from_file = resolve(&config, &TrainToml::default());
        let defaults = resolve(&TrainToml::default(), &TrainToml::default());
        assert_eq!(from_file.device, defaults.device);
        assert_eq!(from_file.loader.variants_per_batch, defaults.loader.variants_per_batch);
        assert_eq!(from_file.loader.num_workers, defaults.loader.num_workers);
        assert_eq!(from_file.loader.keep_multiallelic, defaults.loader.keep_multiallelic);
        assert_eq!(from_file.training.max_gradient_norm, defaults.training.max_gradient_norm);
        assert_eq!(from_file.training.learning_rate, defaults.training.learning_rate);
        assert_eq!(from_file.network.hidden_nonlinearity, defaults.network.hidden_nonlinearity);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<TrainToml>("[loader]\nbatch = 3\n").is_err());
    }

    #[test]
    fn test_cli_override_priority() {
        let file: TrainToml = toml::from_str(
            "[loader]\nnum_workers = 8\nrandom_seed = 1\n[training]\nlearning_rate = 0.01\n",
        )
        .unwrap();
        let cli = TrainToml {
            loader: LoaderOverrides {
                num_workers: Some(16),
                ..Default::default()
            },
            training: TrainingOverrides {
                max_gradient_value: Some(-1.0),
                ..Default::default()
            },
            ..Default::default()
        };
        let resolved = resolve(&file, &cli);
        assert_eq!(resolved.loader.num_workers, 16);
        assert_eq!(resolved.loader.random_seed, 1);
        assert_eq!(resolved.training.learning_rate, 0.01);
        assert_eq!(resolved.training.max_gradient_value, None);
    }
}
