//! Filesystem model registry.
//!
//! ```text
//! {root}/{project}/{model_id}/
//!     {model_id}-1/
//!         metadata.json
//!         model/            <- copy of the saved pipeline directory
//!     {model_id}-2/
//!         ...
//! ```
//!
//! At most one version is in the `production` stage; promoting a version
//! archives whichever version held the stage before.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ModelParams, RegistryConfig};
use crate::error::{PipelineError, Result};

const METADATA_FILE: &str = "metadata.json";
const MODEL_DIR: &str = "model";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[serde(rename = "none")]
    Unassigned,
    Staging,
    Production,
    Archived,
}

impl std::str::FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Stage::Unassigned),
            "staging" => Ok(Stage::Staging),
            "production" => Ok(Stage::Production),
            "archived" => Ok(Stage::Archived),
            other => Err(PipelineError::Registry(format!("unknown stage '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: String,
    pub model_id: String,
    pub number: u32,
    pub stage: Stage,
    pub params: ModelParams,
    pub rmse: f64,
    pub created_at: String,
}

pub struct ModelRegistry {
    root: PathBuf,
    model_id: String,
}

impl ModelRegistry {
    pub fn new(root: &Path, project: &str, model_id: &str) -> Self {
        Self {
            root: root.join(project).join(model_id),
            model_id: model_id.to_string(),
        }
    }

    pub fn from_config(cfg: &RegistryConfig) -> Self {
        Self::new(&cfg.root, &cfg.project, &cfg.model_id)
    }

    fn version_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Where the pipeline of version `id` is stored.
    pub fn artifact_dir(&self, id: &str) -> PathBuf {
        self.version_dir(id).join(MODEL_DIR)
    }

    fn write_metadata(&self, version: &ModelVersion) -> Result<()> {
        let path = self.version_dir(&version.id).join(METADATA_FILE);
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, version)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<ModelVersion> {
        let path = self.version_dir(id).join(METADATA_FILE);
        if !path.exists() {
            return Err(PipelineError::Registry(format!("no version '{id}'")));
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// All versions, oldest first.
    pub fn list_versions(&self) -> Result<Vec<ModelVersion>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(METADATA_FILE).exists() {
                let id = entry.file_name().to_string_lossy().into_owned();
                versions.push(self.get(&id)?);
            }
        }
        versions.sort_by_key(|v| v.number);
        Ok(versions)
    }

    /// Copy a saved pipeline into the registry as a new version.
    pub fn register(&self, pipeline_dir: &Path, params: &ModelParams, rmse: f64) -> Result<ModelVersion> {
        if !pipeline_dir.is_dir() {
            return Err(PipelineError::Registry(format!(
                "pipeline directory {} does not exist",
                pipeline_dir.display()
            )));
        }

        let number = self
            .list_versions()?
            .last()
            .map(|v| v.number + 1)
            .unwrap_or(1);
        let version = ModelVersion {
            id: format!("{}-{number}", self.model_id),
            model_id: self.model_id.clone(),
            number,
            stage: Stage::Unassigned,
            params: params.clone(),
            rmse,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        copy_dir(pipeline_dir, &self.artifact_dir(&version.id))?;
        self.write_metadata(&version)?;
        info!(version = %version.id, rmse, "registered model version");
        Ok(version)
    }

    pub fn set_stage(&self, id: &str, stage: Stage) -> Result<ModelVersion> {
        let mut version = self.get(id)?;

        if stage == Stage::Production {
            for mut other in self.list_versions()? {
                if other.id != version.id && other.stage == Stage::Production {
                    other.stage = Stage::Archived;
                    self.write_metadata(&other)?;
                    info!(version = %other.id, "archived previous production version");
                }
            }
        }

        version.stage = stage;
        self.write_metadata(&version)?;
        info!(version = %version.id, ?stage, "stage updated");
        Ok(version)
    }

    /// The newest version in the `production` stage, if any.
    pub fn production_version(&self) -> Result<Option<ModelVersion>> {
        Ok(self
            .list_versions()?
            .into_iter()
            .rev()
            .find(|v| v.stage == Stage::Production))
    }

    /// Copy the pipeline of version `id` to `dest`.
    pub fn download(&self, id: &str, dest: &Path) -> Result<()> {
        let src = self.artifact_dir(id);
        if !src.is_dir() {
            return Err(PipelineError::Registry(format!("version '{id}' has no model artifacts")));
        }
        copy_dir(&src, dest)
    }
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
