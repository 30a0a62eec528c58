use tokio_util::sync::CancellationToken;

use crate::node::{self, DirHandle, Listing};

pub async fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    // create a temporary directory
    let tmp_dir = tempfile::tempdir()?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt -> ../bar/2.txt
    //    |- 6.txt -> (absolute path) .../foo/bar/3.txt
    let foo_path = tmp_dir.path().join("foo");
    tokio::fs::create_dir(&foo_path).await.unwrap();
    tokio::fs::write(foo_path.join("0.txt"), "0").await.unwrap();
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await.unwrap();
    tokio::fs::write(bar_path.join("1.txt"), "1").await.unwrap();
    tokio::fs::write(bar_path.join("2.txt"), "22").await.unwrap();
    tokio::fs::write(bar_path.join("3.txt"), "333").await.unwrap();
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await.unwrap();
    tokio::fs::write(baz_path.join("4.txt"), "4444").await.unwrap();
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt"))
        .await
        .unwrap();
    tokio::fs::symlink(bar_path.join("3.txt"), baz_path.join("6.txt"))
        .await
        .unwrap();
    Ok(tmp_dir)
}

/// How an in-memory node answers list/size requests.
#[derive(Debug, Clone, Copy, Default)]
pub enum Behavior {
    #[default]
    Ok,
    Fail,
    Delay(std::time::Duration),
    /// Never answers; only returns once the walk is cancelled.
    Hang,
}

impl Behavior {
    async fn apply(&self, what: &str, cancel: &CancellationToken) -> anyhow::Result<()> {
        match self {
            Behavior::Ok => Ok(()),
            Behavior::Fail => Err(anyhow::anyhow!("injected failure on {}", what)),
            Behavior::Delay(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(node::Cancelled.into()),
                    _ = tokio::time::sleep(*delay) => Ok(()),
                }
            }
            Behavior::Hang => {
                cancel.cancelled().await;
                Err(node::Cancelled.into())
            }
        }
    }
}

#[derive(Debug)]
pub struct MemFile {
    name: String,
    size: u64,
    behavior: Behavior,
}

#[derive(Debug, Default)]
pub struct MemDir {
    name: String,
    dirs: Vec<std::sync::Arc<MemDir>>,
    files: Vec<std::sync::Arc<MemFile>>,
    behavior: Behavior,
}

impl MemDir {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn file(self, name: &str, size: u64) -> Self {
        self.file_with(name, size, Behavior::Ok)
    }

    pub fn file_with(mut self, name: &str, size: u64, behavior: Behavior) -> Self {
        self.files.push(std::sync::Arc::new(MemFile {
            name: name.to_string(),
            size,
            behavior,
        }));
        self
    }

    pub fn dir(mut self, dir: MemDir) -> Self {
        self.dirs.push(std::sync::Arc::new(dir));
        self
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn handle(self) -> DirHandle {
        std::sync::Arc::new(self)
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum::<u64>()
            + self.dirs.iter().map(|d| d.total_size()).sum::<u64>()
    }

    pub fn total_files(&self) -> u64 {
        self.files.len() as u64 + self.dirs.iter().map(|d| d.total_files()).sum::<u64>()
    }
}

/// A single directory per level, `depth` levels below the root, each holding one file.
pub fn chain(depth: usize, file_size: u64) -> MemDir {
    let mut dir = MemDir::new(&format!("level{}", depth)).file("f", file_size);
    for level in (0..depth).rev() {
        dir = MemDir::new(&format!("level{}", level))
            .file("f", file_size)
            .dir(dir);
    }
    dir
}

/// A complete tree where every directory has `width` subdirectories and `files` files.
pub fn balanced(depth: usize, width: usize, files: usize, file_size: u64) -> MemDir {
    let mut dir = MemDir::new(&format!("d{}", depth));
    for i in 0..files {
        dir = dir.file(&format!("f{}", i), file_size);
    }
    if depth > 0 {
        for _ in 0..width {
            dir = dir.dir(balanced(depth - 1, width, files, file_size));
        }
    }
    dir
}

#[async_trait::async_trait]
impl node::Dir for MemDir {
    async fn list(&self, cancel: &CancellationToken) -> anyhow::Result<Listing> {
        self.behavior.apply(&self.name, cancel).await?;
        Ok(Listing {
            dirs: self.dirs.iter().map(|d| d.clone() as DirHandle).collect(),
            files: self
                .files
                .iter()
                .map(|f| f.clone() as node::FileHandle)
                .collect(),
        })
    }
}

#[async_trait::async_trait]
impl node::File for MemFile {
    async fn size(&self, cancel: &CancellationToken) -> anyhow::Result<u64> {
        self.behavior.apply(&self.name, cancel).await?;
        Ok(self.size)
    }
}
