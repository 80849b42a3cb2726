//! Configuration loading with env-var overrides.
//!
//! Reads `config/pipeline.toml` (or the path passed on the command line),
//! falls back to built-in defaults for anything missing, then applies the
//! environment overrides listed in [`Config::apply_env`].

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

/// Which month of trip data to train on.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub taxi_type: String,
    pub year: i32,
    pub month: u32,
    /// Prefix the monthly parquet file name is appended to.
    pub base_url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            taxi_type: "green".into(),
            year: 2022,
            month: 2,
            base_url: "https://d37ci6vzurychx.cloudfront.net/trip-data/".into(),
        }
    }
}

/// Bounds applied when deriving the duration label.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub min_duration: f64,
    pub max_duration: f64,
    /// Seconds per duration unit; the raw timestamp delta is divided by this.
    pub duration_unit_secs: f64,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            min_duration: 1.0,
            max_duration: 60.0,
            duration_unit_secs: 20.0,
        }
    }
}

/// Regressor hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Number of boosting rounds.
    pub n_estimators: u32,
    pub max_depth: u32,
    /// Learning rate.
    pub eta: f32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 10,
            eta: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_root: PathBuf,
    pub models_root: PathBuf,
    pub training_report: PathBuf,
    pub deploy_report: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: "data".into(),
            models_root: "models".into(),
            training_report: "latest_performance.md".into(),
            deploy_report: "deploy-report.md".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// A local directory standing in for the bucket.
    Local,
    /// S3 or an S3-compatible service such as MinIO.
    S3,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub backend: StorageBackend,
    pub bucket: String,
    /// Directory holding the buckets of the `local` backend.
    pub local_root: PathBuf,
    /// Endpoint override for `s3`; AWS itself when unset.
    pub endpoint: Option<String>,
    /// Key prefix every object lands under.
    pub prefix: String,
    pub region: String,
    /// Static credentials for `s3`. Without them the default AWS credential
    /// chain is used (env, profile, instance metadata).
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: StorageBackend::S3,
            bucket: "taxi-duration".into(),
            local_root: "bucket".into(),
            endpoint: None,
            prefix: "web-service".into(),
            region: "eu-west-1".into(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub root: PathBuf,
    pub project: String,
    pub model_id: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: "registry".into(),
            project: "taxi-duration".into(),
            model_id: "MLOPS-RF1".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Where `deploy` stages the production pipeline and `serve` loads it
    /// from. When it holds no pipeline, `serve` fetches the registry's
    /// production version instead.
    pub pipeline: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9696,
            pipeline: PathBuf::from("serving").join("model"),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Fully-resolved pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub source: SourceConfig,
    pub transform: TransformConfig,
    pub model: ModelParams,
    pub paths: PathsConfig,
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            source: SourceConfig::default(),
            transform: TransformConfig::default(),
            model: ModelParams::default(),
            paths: PathsConfig::default(),
            storage: StorageConfig::default(),
            registry: RegistryConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Apply environment overrides. `lookup` is `env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BASE_URL") {
            self.source.base_url = v;
        }
        if let Some(v) = lookup("DATA_ROOT_LOCAL_FOLDER") {
            self.paths.data_root = v.into();
        }
        if let Some(v) = lookup("S3_BUCKET") {
            self.storage.bucket = v;
            self.storage.enabled = true;
        }
        if let Some(v) = lookup("STORAGE_ENDPOINT") {
            self.storage.endpoint = Some(v);
        }
        if let Some(v) = lookup("AWS_REGION") {
            self.storage.region = v;
        }
        if let Some(v) = lookup("REGISTRY_ROOT") {
            self.registry.root = v.into();
        }
        if let Some(v) = lookup("REGISTRY_PROJECT") {
            self.registry.project = v;
        }
        if let Some(v) = lookup("MODEL_ID") {
            self.registry.model_id = v;
        }
        if let Some(v) = lookup("PORT") {
            self.server.port = v
                .parse()
                .map_err(|_| PipelineError::Config(format!("PORT is not a port number: '{v}'")))?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=12).contains(&self.source.month) {
            return Err(PipelineError::Config(format!(
                "source.month must be 1..=12, got {}",
                self.source.month
            )));
        }
        if self.source.taxi_type.is_empty() {
            return Err(PipelineError::Config("source.taxi_type is empty".into()));
        }
        let t = &self.transform;
        if t.min_duration > t.max_duration {
            return Err(PipelineError::Config(format!(
                "transform.min_duration ({}) exceeds max_duration ({})",
                t.min_duration, t.max_duration
            )));
        }
        if t.duration_unit_secs <= 0.0 {
            return Err(PipelineError::Config(
                "transform.duration_unit_secs must be positive".into(),
            ));
        }
        if self.model.n_estimators == 0 {
            return Err(PipelineError::Config("model.n_estimators must be >= 1".into()));
        }
        if self.storage.access_key_id.is_some() != self.storage.secret_access_key.is_some() {
            return Err(PipelineError::Config(
                "storage.access_key_id and storage.secret_access_key go together".into(),
            ));
        }
        crate::logger::parse_level(&self.log_level)
            .map_err(|e| PipelineError::Config(format!("log_level: {e}")))?;
        Ok(())
    }
}

/// Load the configuration file (when present) and apply env overrides.
///
/// An explicit `path` must exist; the default path is optional.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => {
            let raw = fs::read_to_string(p).map_err(|e| {
                PipelineError::Config(format!("cannot read {}: {e}", p.display()))
            })?;
            Config::from_toml_str(&raw)?
        }
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Config::from_toml_str(&fs::read_to_string(default)?)?
            } else {
                Config::default()
            }
        }
    };

    config.apply_env(|key| env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
