//! Filesystem abstraction walked by the sizer
//!
//! The sizer never touches a filesystem directly. It is handed a root [`Dir`] and from there only
//! ever asks directories for their children and files for their size. Both operations receive the
//! walk's cancellation token and must return promptly once it fires.

use tokio_util::sync::CancellationToken;

pub type DirHandle = std::sync::Arc<dyn Dir>;
pub type FileHandle = std::sync::Arc<dyn File>;

/// Immediate children of a directory.
#[derive(Default)]
pub struct Listing {
    pub dirs: Vec<DirHandle>,
    pub files: Vec<FileHandle>,
}

impl std::fmt::Debug for Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Listing")
            .field("dirs", &self.dirs.len())
            .field("files", &self.files.len())
            .finish()
    }
}

#[async_trait::async_trait]
pub trait Dir: std::fmt::Debug + Send + Sync {
    async fn list(&self, cancel: &CancellationToken) -> anyhow::Result<Listing>;
}

#[async_trait::async_trait]
pub trait File: std::fmt::Debug + Send + Sync {
    async fn size(&self, cancel: &CancellationToken) -> anyhow::Result<u64>;
}

/// Error returned by filesystem implementations when the walk got cancelled mid-operation.
#[derive(Debug, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;
