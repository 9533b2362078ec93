use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Run configuration: `AGECAL_*` environment variables with defaults, then
/// an optional TOML file, then command-line flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory holding ONNX graphs and fitted artifacts.
    pub model_dir: PathBuf,
    /// Embedding network (default: `<model_dir>/mobilefacenet.onnx`).
    pub embedder_model: PathBuf,
    /// Age estimator, native `.json` or `.onnx` (default: `<model_dir>/age_estimator.json`).
    pub age_model: PathBuf,
    /// L2 strength for the constrained linear strategy.
    pub regularization_strength: f64,
    /// Stop extraction after this many samples.
    pub sample_cap: Option<usize>,
    /// FAR at which TAR is reported.
    pub target_far: f64,
    pub seed: u64,
    pub validation_fraction: f32,
    /// Synthetic labeler: similarity above this is a positive.
    pub positive_threshold: f32,
    pub negative_pairs: usize,
    pub positive_pairs: usize,
    pub window: usize,
}

/// Keys accepted in a TOML config file; all optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub model_dir: Option<PathBuf>,
    pub embedder_model: Option<PathBuf>,
    pub age_model: Option<PathBuf>,
    pub regularization_strength: Option<f64>,
    pub sample_cap: Option<usize>,
    pub target_far: Option<f64>,
    pub seed: Option<u64>,
    pub validation_fraction: Option<f32>,
    pub positive_threshold: Option<f32>,
    pub negative_pairs: Option<usize>,
    pub positive_pairs: Option<usize>,
    pub window: Option<usize>,
}

impl Config {
    /// Load configuration from `AGECAL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("AGECAL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir(&var).join("models"));

        Self {
            embedder_model: var("AGECAL_EMBEDDER_MODEL")
                .map(PathBuf::from)
                .unwrap_or_else(|| model_dir.join("mobilefacenet.onnx")),
            age_model: var("AGECAL_AGE_MODEL")
                .map(PathBuf::from)
                .unwrap_or_else(|| model_dir.join("age_estimator.json")),
            model_dir,
            regularization_strength: parse_var(&var, "AGECAL_REGULARIZATION_STRENGTH").unwrap_or(0.01),
            sample_cap: parse_var(&var, "AGECAL_SAMPLE_CAP"),
            target_far: parse_var(&var, "AGECAL_TARGET_FAR").unwrap_or(1e-3),
            seed: parse_var(&var, "AGECAL_SEED").unwrap_or(42),
            validation_fraction: parse_var(&var, "AGECAL_VALIDATION_FRACTION").unwrap_or(0.2),
            positive_threshold: parse_var(&var, "AGECAL_POSITIVE_THRESHOLD").unwrap_or(0.75),
            negative_pairs: parse_var(&var, "AGECAL_NEGATIVE_PAIRS").unwrap_or(1000),
            positive_pairs: parse_var(&var, "AGECAL_POSITIVE_PAIRS").unwrap_or(200),
            window: parse_var(&var, "AGECAL_WINDOW").unwrap_or(200),
        }
    }

    /// Overlay the keys present in `file`. A new `model_dir` moves model
    /// paths that were still at their defaults.
    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(dir) = file.model_dir {
            if self.embedder_model == self.model_dir.join("mobilefacenet.onnx") {
                self.embedder_model = dir.join("mobilefacenet.onnx");
            }
            if self.age_model == self.model_dir.join("age_estimator.json") {
                self.age_model = dir.join("age_estimator.json");
            }
            self.model_dir = dir;
        }
        if let Some(v) = file.embedder_model {
            self.embedder_model = v;
        }
        if let Some(v) = file.age_model {
            self.age_model = v;
        }
        if let Some(v) = file.regularization_strength {
            self.regularization_strength = v;
        }
        if file.sample_cap.is_some() {
            self.sample_cap = file.sample_cap;
        }
        if let Some(v) = file.target_far {
            self.target_far = v;
        }
        if let Some(v) = file.seed {
            self.seed = v;
        }
        if let Some(v) = file.validation_fraction {
            self.validation_fraction = v;
        }
        if let Some(v) = file.positive_threshold {
            self.positive_threshold = v;
        }
        if let Some(v) = file.negative_pairs {
            self.negative_pairs = v;
        }
        if let Some(v) = file.positive_pairs {
            self.positive_pairs = v;
        }
        if let Some(v) = file.window {
            self.window = v;
        }
    }

    /// Environment, then the TOML file at `path` if given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::from_env();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
            let file: ConfigFile = toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
            config.apply_file(file);
        }
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.trim().parse().ok())
}

fn default_data_dir(var: &impl Fn(&str) -> Option<String>) -> PathBuf {
    var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("agecal")
}
