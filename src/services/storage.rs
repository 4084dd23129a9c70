use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use tracing::info;

use crate::config::{AppConfig, StorageBackend};

/// Blob storage for videos and plate crops.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload_file(
        &self,
        bucket: &str,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// URL a worker can read the object from. `file://` means a local path.
    async fn presigned_url(
        &self,
        bucket: &str,
        path: &str,
        expiry: Duration,
    ) -> Result<String, StorageError>;
}

/// Cloudflare R2 object storage (S3-compatible).
pub struct R2Store {
    region: Region,
    credentials: Credentials,
}

impl R2Store {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))
    }
}

#[async_trait]
impl ObjectStore for R2Store {
    async fn upload_file(
        &self,
        bucket: &str,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .bucket(bucket)?
            .put_object_with_content_type(path, data, content_type)
            .await
            .map_err(StorageError::S3)?;

        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(StorageError::Status {
                status,
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn presigned_url(
        &self,
        bucket: &str,
        path: &str,
        expiry: Duration,
    ) -> Result<String, StorageError> {
        let expiry_secs = u32::try_from(expiry.as_secs()).unwrap_or(u32::MAX);
        self.bucket(bucket)?
            .presign_get(path, expiry_secs, None)
            .await
            .map_err(StorageError::S3)
    }
}

/// Filesystem-backed store rooted at a directory, one subdirectory per bucket.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()?.join(root)
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of `bucket/path`. Rejects paths escaping the root.
    pub fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir)
        });
        if escapes || bucket.contains(['/', '\\']) || bucket == ".." {
            return Err(StorageError::InvalidPath(format!("{}/{}", bucket, path)));
        }
        Ok(self.root.join(bucket).join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn upload_file(
        &self,
        bucket: &str,
        path: &str,
        data: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let target = self.object_path(bucket, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, data).await?;
        Ok(())
    }

    async fn presigned_url(
        &self,
        bucket: &str,
        path: &str,
        _expiry: Duration,
    ) -> Result<String, StorageError> {
        let target = self.object_path(bucket, path)?;
        Ok(format!("file://{}", target.display()))
    }
}

/// The object store selected by `STORAGE_BACKEND`.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match config.storage_backend {
        StorageBackend::R2 => {
            let missing = |key: &str| StorageError::Config(format!("{} is required for r2 storage", key));
            let endpoint = config.r2_endpoint.as_deref().ok_or_else(|| missing("R2_ENDPOINT"))?;
            let access_key = config.r2_access_key.as_deref().ok_or_else(|| missing("R2_ACCESS_KEY"))?;
            let secret_key = config.r2_secret_key.as_deref().ok_or_else(|| missing("R2_SECRET_KEY"))?;
            info!(endpoint, "Using R2 object storage");
            Ok(Arc::new(R2Store::new(endpoint, access_key, secret_key)?))
        }
        StorageBackend::Local => {
            let store = LocalStore::new(&config.local_storage_root)?;
            info!(root = %store.root().display(), "Using local object storage");
            Ok(Arc::new(store))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("S3 returned status {status} for {path}")]
    Status { status: u16, path: String },

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
