use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::node::{self, DirHandle, FileHandle, Listing};

/// Directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDir {
    path: std::path::PathBuf,
}

/// Any non-directory entry on the local filesystem. Symlinks are not followed, their size is the
/// size of the link itself.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: std::path::PathBuf,
}

impl LocalDir {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn handle(path: impl Into<std::path::PathBuf>) -> DirHandle {
        std::sync::Arc::new(Self::new(path))
    }

    async fn read_children(&self) -> anyhow::Result<Listing> {
        let mut entries = tokio::fs::read_dir(&self.path)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", &self.path))?;
        let mut listing = Listing::default();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", &self.path))?
        {
            let entry_path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("failed reading file type of {:?}", &entry_path))?;
            if file_type.is_dir() {
                listing.dirs.push(LocalDir::handle(entry_path));
            } else {
                listing.files.push(LocalFile::handle(entry_path));
            }
        }
        Ok(listing)
    }
}

impl LocalFile {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn handle(path: impl Into<std::path::PathBuf>) -> FileHandle {
        std::sync::Arc::new(Self::new(path))
    }
}

#[async_trait::async_trait]
impl node::Dir for LocalDir {
    #[instrument(skip(cancel))]
    async fn list(&self, cancel: &CancellationToken) -> anyhow::Result<Listing> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(node::Cancelled.into()),
            listing = self.read_children() => listing,
        }
    }
}

#[async_trait::async_trait]
impl node::File for LocalFile {
    async fn size(&self, cancel: &CancellationToken) -> anyhow::Result<u64> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(node::Cancelled.into()),
            metadata = tokio::fs::symlink_metadata(&self.path) => Ok(metadata
                .with_context(|| format!("failed reading metadata from {:?}", &self.path))?
                .len()),
        }
    }
}
