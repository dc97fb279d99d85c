use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::StorageError;

/// Resolves an opaque input reference to the uploaded bytes.
#[async_trait]
pub trait StorageResolver: Send + Sync {
    async fn resolve(&self, input_ref: &str) -> Result<Vec<u8>, StorageError>;
}

/// Uploads kept as flat files under one directory. Input references are
/// file names relative to that directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalStorage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes an upload and returns its input reference.
    pub async fn store(&self, filename: &str, data: &[u8]) -> Result<String, StorageError> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            fs::create_dir_all(&self.root).await?;
        }

        // Sanitize filename to prevent directory traversal
        let file_name = Path::new(filename)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let input_ref = format!("{}_{}", Uuid::new_v4(), file_name);

        let path = self.root.join(&input_ref);
        let mut file = File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        tracing::info!(input_ref = %input_ref, bytes = data.len(), "upload stored");
        Ok(input_ref)
    }

    fn path_for(&self, input_ref: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(input_ref);
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(relative)),
            _ => Err(StorageError::InvalidReference(input_ref.to_string())),
        }
    }
}

#[async_trait]
impl StorageResolver for LocalStorage {
    async fn resolve(&self, input_ref: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(input_ref)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(input_ref.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
