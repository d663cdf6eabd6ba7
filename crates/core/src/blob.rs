use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;
use walkdir::WalkDir;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, uri: &str, bytes: &[u8]) -> Result<()>;
    async fn get(&self, uri: &str) -> Result<Vec<u8>>;
    /// Removes every blob whose URI starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// URIs must stay inside the root: absolute paths and parent traversal
/// are rejected.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf> {
        let relative = Path::new(uri);
        if uri.trim().is_empty() || relative.is_absolute() {
            return Err(PipelineError::InvalidUri(uri.to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(PipelineError::InvalidUri(uri.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, uri: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(uri, size = bytes.len(), "blob stored");
        Ok(())
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.resolve(uri)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let base = self.resolve(prefix)?;
        if !base.exists() {
            return Ok(());
        }
        if base.is_dir() {
            tokio::fs::remove_dir_all(&base).await?;
            return Ok(());
        }
        // Prefix may name part of a filename rather than a directory.
        let Some(parent) = base.parent() else {
            return Ok(());
        };
        let needle = base.to_path_buf();
        for entry in WalkDir::new(parent).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && entry.path().starts_with(&needle) {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, uri: &str, bytes: &[u8]) -> Result<()> {
        if uri.trim().is_empty() {
            return Err(PipelineError::InvalidUri(uri.to_string()));
        }
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| PipelineError::Registry("blob lock poisoned".to_string()))?;
        blobs.insert(uri.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| PipelineError::Registry("blob lock poisoned".to_string()))?;
        blobs.get(uri).cloned().ok_or_else(|| {
            PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no blob at {uri}"),
            ))
        })
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| PipelineError::Registry("blob lock poisoned".to_string()))?;
        blobs.retain(|uri, _| !uri.starts_with(prefix));
        Ok(())
    }
}
