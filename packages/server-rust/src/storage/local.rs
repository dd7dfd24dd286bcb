//! `file://` storage: objects are plain files under the bucket directory.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use nodekeeper_core::RemoteLocation;

use crate::traits::StorageTransfer;

/// [`StorageTransfer`] over a local (or locally mounted) directory tree.
///
/// The object for key `k` under location `file:///root/c/dc/n` lives at
/// `/root/c/dc/n/k`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileStorage;

impl LocalFileStorage {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Resolves a key to a path, refusing keys that would escape the bucket.
    fn resolve(location: &RemoteLocation, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            anyhow::bail!("invalid storage key '{key}'");
        }
        Ok(Path::new(&location.bucket).join(location.key(key)))
    }
}

#[async_trait]
impl StorageTransfer for LocalFileStorage {
    async fn upload(&self, location: &RemoteLocation, key: &str, local: &Path) -> anyhow::Result<u64> {
        let target = Self::resolve(location, key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::copy(local, &target)
            .await
            .with_context(|| format!("copying {} to {}", local.display(), target.display()))
    }

    async fn download(&self, location: &RemoteLocation, key: &str, local: &Path) -> anyhow::Result<u64> {
        let source = Self::resolve(location, key)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::copy(&source, local)
            .await
            .with_context(|| format!("copying {} to {}", source.display(), local.display()))
    }

    async fn put_bytes(&self, location: &RemoteLocation, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let target = Self::resolve(location, key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("writing {}", target.display()))
    }

    async fn get_bytes(&self, location: &RemoteLocation, key: &str) -> anyhow::Result<Vec<u8>> {
        let source = Self::resolve(location, key)?;
        tokio::fs::read(&source)
            .await
            .with_context(|| format!("reading {}", source.display()))
    }

    async fn exists(&self, location: &RemoteLocation, key: &str) -> anyhow::Result<bool> {
        let source = Self::resolve(location, key)?;
        tokio::fs::try_exists(&source)
            .await
            .with_context(|| format!("checking {}", source.display()))
    }
}
