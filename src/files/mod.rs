//! Local cache of remote objects with per-key download de-duplication.
//!
//! Concurrent [`FileManager::fetch`] calls for the same key wait for each
//! other, so an object is downloaded at most once at a time; the second
//! caller finds the file already in place. Downloads are written to a
//! temporary file next to the destination and renamed into place, so a
//! partially downloaded object is never visible under its final name.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::context::Context;
use crate::sync::MutexMap;
use crate::{Error, Result};

/// Downloads objects from remote storage.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Write the object stored under `key` to `dest`, creating or
    /// truncating it.
    async fn fetch_to(&self, ctx: &Context, key: &str, dest: &Path) -> Result<()>;
}

/// Copies objects from a local directory, e.g. a mounted bucket.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    source: PathBuf,
}

impl DirectoryFetcher {
    /// Serve objects from `source`.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl ObjectFetcher for DirectoryFetcher {
    async fn fetch_to(&self, ctx: &Context, key: &str, dest: &Path) -> Result<()> {
        let source = self.source.join(validate_key(key)?);
        ctx.run(tokio::fs::copy(&source, dest))
            .await?
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("copy '{}': {e}", source.display()),
                ))
            })?;
        Ok(())
    }
}

/// Local object cache rooted at one directory.
pub struct FileManager {
    root: PathBuf,
    fetcher: Arc<dyn ObjectFetcher>,
    locks: MutexMap<String>,
}

impl std::fmt::Debug for FileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileManager")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl FileManager {
    /// Cache under `root`, downloading through `fetcher`.
    pub fn new(root: impl Into<PathBuf>, fetcher: Arc<dyn ObjectFetcher>) -> Self {
        Self {
            root: root.into(),
            fetcher,
            locks: MutexMap::new(),
        }
    }

    /// Cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `key` is stored locally.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for keys that are empty, absolute or contain
    /// `.` / `..` components.
    pub fn local_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_key(key)?))
    }

    /// Path of `key`, downloading it first unless already present.
    ///
    /// Dropping the returned future mid-download releases the key and
    /// removes the partial file.
    ///
    /// # Errors
    ///
    /// Returns key validation, lock, context or download errors.
    pub async fn fetch(&self, ctx: &Context, key: &str) -> Result<PathBuf> {
        let path = self.local_path(key)?;
        let _guard = self.locks.lock_guard(ctx, key.to_string()).await?;
        self.fetch_locked(ctx, key, &path).await?;
        Ok(path)
    }

    async fn fetch_locked(&self, ctx: &Context, key: &str, path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            debug!(key, "Object already cached");
            return Ok(());
        }

        let parent = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("'{}' has no parent", path.display())))?;
        tokio::fs::create_dir_all(parent).await?;

        let partial = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(parent)?
            .into_temp_path();
        self.fetcher.fetch_to(ctx, key, &partial).await?;
        ctx.check()?;

        partial.persist(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.error.kind(),
                format!("move download into '{}': {}", path.display(), e.error),
            ))
        })?;
        info!(key, path = %path.display(), "Downloaded object");
        Ok(())
    }

    /// Stop accepting fetches and wait for in-flight downloads.
    ///
    /// Fetches waiting on a key that is being downloaded fail with
    /// [`Error::LockClosed`] instead of starting their own download.
    ///
    /// # Errors
    ///
    /// Returns the context error if `ctx` is done before that.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        self.locks.close(ctx).await
    }
}

fn validate_key(key: &str) -> Result<&Path> {
    let path = Path::new(key);
    let normal = !key.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if !normal {
        return Err(Error::Config(format!("Invalid object key '{key}'")));
    }
    Ok(path)
}
