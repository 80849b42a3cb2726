//! Artifact uploads to the project bucket.
//!
//! Uploads are best-effort: [`upload_file`] reports success as a bool and a
//! failed upload is logged, never propagated.

use std::fs;
use std::path::{Path, PathBuf};

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::runtime::Runtime;
use tracing::{debug, error, info};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{PipelineError, Result};

pub trait ObjectStore {
    /// Copy the file at `local` to `key`.
    fn put(&self, key: &str, local: &Path) -> Result<()>;

    /// Human-readable location used in logs, e.g. `s3://bucket`.
    fn describe(&self) -> String;
}

/// A directory that stands in for the bucket; keys become relative paths.
pub struct LocalBucket {
    root: PathBuf,
}

impl LocalBucket {
    pub fn new(base: impl Into<PathBuf>, bucket: &str) -> Self {
        Self {
            root: base.into().join(bucket),
        }
    }

    pub fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStore for LocalBucket {
    fn put(&self, key: &str, local: &Path) -> Result<()> {
        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(local, &dest)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// An S3 bucket, or a bucket on an S3-compatible service when `endpoint` is
/// set. Requests are signed with the static credentials from the config or,
/// failing those, whatever the default AWS credential chain provides.
pub struct S3Bucket {
    runtime: Runtime,
    client: Client,
    bucket: String,
}

impl S3Bucket {
    pub fn new(cfg: &StorageConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let region = Region::new(cfg.region.clone());

        let mut builder = match (&cfg.access_key_id, &cfg.secret_access_key) {
            (Some(id), Some(secret)) => aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .region(region)
                .credentials_provider(Credentials::new(id, secret, None, None, "pipeline-config")),
            _ => {
                let shared = runtime.block_on(
                    aws_config::defaults(BehaviorVersion::latest())
                        .region(region)
                        .load(),
                );
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };
        if let Some(endpoint) = &cfg.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            runtime,
            client: Client::from_conf(builder.build()),
            bucket: cfg.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

impl ObjectStore for S3Bucket {
    fn put(&self, key: &str, local: &Path) -> Result<()> {
        let body = fs::read(local)?;
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send();
        self.runtime.block_on(request).map_err(|e| {
            PipelineError::Storage(format!(
                "put s3://{}/{key}: {}",
                self.bucket,
                DisplayErrorContext(&e)
            ))
        })?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// Build the configured store, or `None` when uploads are disabled.
pub fn from_config(cfg: &StorageConfig) -> Result<Option<Box<dyn ObjectStore>>> {
    if !cfg.enabled {
        return Ok(None);
    }
    let store: Box<dyn ObjectStore> = match cfg.backend {
        StorageBackend::Local => Box::new(LocalBucket::new(&cfg.local_root, &cfg.bucket)),
        StorageBackend::S3 => Box::new(S3Bucket::new(cfg)?),
    };
    info!(store = %store.describe(), region = %cfg.region, "artifact uploads enabled");
    Ok(Some(store))
}

/// Object key for a local file: `{prefix}/{subfolder}/{file name}`.
pub fn object_key(prefix: &str, subfolder: &str, file: &Path) -> String {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    [prefix, subfolder, name.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .map(|part| part.trim_matches('/'))
        .collect::<Vec<_>>()
        .join("/")
}

/// Upload `file` under `subfolder`; returns `false` (after logging) on failure.
pub fn upload_file(store: &dyn ObjectStore, prefix: &str, file: &Path, subfolder: &str) -> bool {
    let key = object_key(prefix, subfolder, file);
    match store.put(&key, file) {
        Ok(()) => {
            debug!(file = %file.display(), %key, "uploaded artifact");
            true
        }
        Err(e) => {
            error!(file = %file.display(), %key, "upload failed: {e}");
            false
        }
    }
}

/// A store plus the key prefix every upload of a run shares.
pub struct Uploader<'a> {
    store: &'a dyn ObjectStore,
    prefix: &'a str,
}

impl<'a> Uploader<'a> {
    pub fn new(store: &'a dyn ObjectStore, prefix: &'a str) -> Self {
        Self { store, prefix }
    }

    pub fn upload(&self, file: &Path, subfolder: &str) -> bool {
        upload_file(self.store, self.prefix, file, subfolder)
    }
}
