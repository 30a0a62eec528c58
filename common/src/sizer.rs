//! Concurrent directory size aggregation
//!
//! [`size`] walks a tree of [`node::Dir`]s and sums the sizes of all files it finds. Every
//! directory is handled by an *explorer*, which lists it, sizes its files and then, for every
//! subdirectory, either spawns a new tokio task or continues inline on the current one.
//!
//! # Termination
//!
//! The shape of the tree is unknown up front so the number of explorers is too. Completion is
//! tracked with an outstanding-explorer counter which starts at 1 (the root). A parent registers
//! each child *before* the child can run and deregisters itself only after all of its children
//! were registered, so the counter can only reach zero once the whole tree was explored. The
//! counter shares a lock with the sender of the outcome stream: the final decrement drops it,
//! which closes the stream exactly once. Partial results and errors travel on that one stream, so
//! an error published by the last explorer is always received before the close.
//!
//! # Admission
//!
//! With `max_workers == 0` every subdirectory gets its own task. Otherwise a subdirectory is only
//! spawned if a worker slot can be reserved (single compare-and-increment); the slot is returned
//! when the spawned task, including everything it explored inline, is done. The root task holds a
//! slot as well, so at most `max_workers` explorer tasks ever run at once.
//!
//! # Failure
//!
//! The first error (or cancellation of the caller's token) wins. All explorers share a child
//! token of the caller's token which is then cancelled; explorers check it before every
//! filesystem call. The call only returns once the outstanding counter drained.

use anyhow::Context as _;
use async_recursion::async_recursion;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::node::{self, DirHandle};
use crate::progress;

#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    /// Maximum number of concurrently running explorer tasks, 0 means unbounded
    pub max_workers: usize,
}

/// Total size and number of files. Directories are not counted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub size: u64,
    pub count: u64,
}

impl Summary {
    /// Returns `None` if either the size or the count would overflow.
    pub fn checked_add(self, other: Self) -> Option<Self> {
        Some(Self {
            size: self.size.checked_add(other.size)?,
            count: self.count.checked_add(other.count)?,
        })
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "size: {} ({} bytes)\nfiles: {}",
            bytesize::ByteSize(self.size),
            self.size,
            self.count
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A directory could not be listed or a file could not be sized.
    #[error("error occurred in one of the explorer tasks: {0:#}")]
    Worker(anyhow::Error),
    /// The caller cancelled the walk (or its deadline passed).
    #[error("directory size computation was cancelled")]
    Cancelled,
}

type Outcome = anyhow::Result<Summary>;

struct TrackerState {
    outstanding: usize,
    // None once the last explorer finished
    sink: Option<tokio::sync::mpsc::UnboundedSender<Outcome>>,
}

/// Outstanding explorer counter plus the stream explorers publish into.
struct Tracker {
    state: std::sync::Mutex<TrackerState>,
}

impl Tracker {
    fn new(sink: tokio::sync::mpsc::UnboundedSender<Outcome>) -> Self {
        Self {
            state: std::sync::Mutex::new(TrackerState {
                outstanding: 1,
                sink: Some(sink),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        // the state is two plain values, a panic elsewhere cannot leave it half-updated
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn register(&self) {
        let mut state = self.lock();
        debug_assert!(state.outstanding > 0, "registering into a finished walk");
        state.outstanding += 1;
    }

    fn publish(&self, outcome: Outcome) {
        if let Some(sink) = &self.lock().sink {
            // the receiver only goes away after the stream was closed
            let _ = sink.send(outcome);
        }
    }

    /// Returns true if this was the last outstanding explorer.
    fn finish(&self) -> bool {
        let mut state = self.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            state.sink = None;
            return true;
        }
        false
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.lock().outstanding
    }
}

/// Bounded pool of explorer task slots.
#[derive(Debug)]
pub(crate) struct WorkerSlots {
    max: usize,
    current: AtomicUsize,
    peak: AtomicUsize,
}

pub(crate) struct WorkerSlot {
    slots: std::sync::Arc<WorkerSlots>,
}

impl WorkerSlots {
    pub(crate) fn new(max: usize) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            max,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn occupy(self: &std::sync::Arc<Self>, now: usize) -> WorkerSlot {
        self.peak.fetch_max(now, Ordering::AcqRel);
        WorkerSlot {
            slots: self.clone(),
        }
    }

    /// The root explorer always runs, regardless of the bound.
    fn acquire_root(self: &std::sync::Arc<Self>) -> WorkerSlot {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.occupy(now)
    }

    fn try_acquire(self: &std::sync::Arc<Self>) -> Option<WorkerSlot> {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if self.max != 0 && current >= self.max {
                return None;
            }
            match self.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(self.occupy(current + 1)),
                Err(actual) => current = actual,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.slots.current.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-walk state shared by all explorers.
struct Context {
    tracker: Tracker,
    slots: std::sync::Arc<WorkerSlots>,
    progress: std::sync::Arc<progress::Progress>,
    throttle: std::sync::Arc<throttle::Throttle>,
    cancel: CancellationToken,
}

type SharedContext = std::sync::Arc<Context>;

async fn or_cancelled<F: std::future::Future>(
    cancel: &CancellationToken,
    fut: F,
) -> anyhow::Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(node::Cancelled.into()),
        output = fut => Ok(output),
    }
}

fn spawn_explorer(ctx: SharedContext, dir: DirHandle, slot: WorkerSlot) {
    ctx.progress.tasks_spawned.inc();
    tokio::spawn(async move {
        explore(&ctx, dir).await;
        drop(slot);
    });
}

#[async_recursion]
async fn explore(ctx: &SharedContext, dir: DirHandle) {
    let _prog_guard = ctx.progress.ops.guard();
    match explore_dir(ctx, &dir).await {
        Ok(summary) => ctx.tracker.publish(Ok(summary)),
        Err(error) => {
            if ctx.cancel.is_cancelled() {
                tracing::debug!("explore {:?}: stopped, walk was cancelled", &dir);
            } else {
                tracing::debug!("explore {:?} failed with: {:#}", &dir, &error);
                ctx.tracker.publish(Err(error));
            }
        }
    }
    if ctx.tracker.finish() {
        tracing::debug!("explore {:?}: last explorer done", &dir);
    }
}

async fn explore_dir(ctx: &SharedContext, dir: &DirHandle) -> anyhow::Result<Summary> {
    let listing = {
        let _open_file_guard = or_cancelled(&ctx.cancel, ctx.throttle.open_file_permit()).await?;
        or_cancelled(&ctx.cancel, ctx.throttle.get_ops_token()).await?;
        dir.list(&ctx.cancel)
            .await
            .with_context(|| format!("failed listing {:?}", dir))?
    };
    ctx.progress.directories_listed.inc();
    tracing::trace!("explore {:?}: {:?}", dir, &listing);
    let mut summary = Summary::default();
    for file in &listing.files {
        or_cancelled(&ctx.cancel, ctx.throttle.get_ops_token()).await?;
        let size = file
            .size(&ctx.cancel)
            .await
            .with_context(|| format!("failed reading size of {:?}", file))?;
        summary = summary
            .checked_add(Summary { size, count: 1 })
            .ok_or_else(|| anyhow::anyhow!("size of {:?} overflowed", dir))?;
        ctx.progress.files_sized.inc();
        ctx.progress.bytes_found.add(size);
    }
    for subdir in listing.dirs {
        if ctx.cancel.is_cancelled() {
            break;
        }
        // must happen before the child can finish, otherwise the counter could hit zero early
        ctx.tracker.register();
        match ctx.slots.try_acquire() {
            Some(slot) => spawn_explorer(ctx.clone(), subdir, slot),
            None => {
                ctx.progress.inline_recursions.inc();
                explore(ctx, subdir).await;
            }
        }
    }
    Ok(summary)
}

/// Computes the total size and file count of the tree below `root`.
///
/// Returns [`Error::Worker`] with the first filesystem error any explorer hit, or
/// [`Error::Cancelled`] once `cancel` fires. In both cases all explorers are stopped before this
/// function returns.
#[instrument(skip(progress, throttle, cancel))]
pub async fn size(
    root: DirHandle,
    settings: &Settings,
    progress: &std::sync::Arc<progress::Progress>,
    throttle: &std::sync::Arc<throttle::Throttle>,
    cancel: &CancellationToken,
) -> Result<Summary, Error> {
    walk(
        root,
        WorkerSlots::new(settings.max_workers),
        progress,
        throttle,
        cancel,
    )
    .await
}

async fn walk(
    root: DirHandle,
    slots: std::sync::Arc<WorkerSlots>,
    progress: &std::sync::Arc<progress::Progress>,
    throttle: &std::sync::Arc<throttle::Throttle>,
    cancel: &CancellationToken,
) -> Result<Summary, Error> {
    let (outcomes_tx, mut outcomes) = tokio::sync::mpsc::unbounded_channel();
    let ctx = std::sync::Arc::new(Context {
        tracker: Tracker::new(outcomes_tx),
        slots: slots.clone(),
        progress: progress.clone(),
        throttle: throttle.clone(),
        cancel: cancel.child_token(),
    });
    // stop the explorers even if this future is dropped before completing
    let _cancel_on_drop = ctx.cancel.clone().drop_guard();
    spawn_explorer(ctx.clone(), root, slots.acquire_root());
    let mut total = Summary::default();
    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(Error::Cancelled),
            outcome = outcomes.recv() => match outcome {
                Some(Ok(partial)) => match total.checked_add(partial) {
                    Some(sum) => total = sum,
                    None => break Err(Error::Worker(anyhow::anyhow!("total size overflowed"))),
                },
                Some(Err(error)) => break Err(Error::Worker(error)),
                None => break Ok(total),
            },
        }
    };
    if let Err(error) = &outcome {
        tracing::debug!("walk failed: {}, stopping outstanding explorers", error);
        ctx.cancel.cancel();
        // the stream closes once the last explorer finished
        while outcomes.recv().await.is_some() {}
    }
    tracing::debug!(
        "walk done, peak explorer tasks: {}, spawned: {}, inline: {}",
        slots.peak(),
        progress.tasks_spawned.get(),
        progress.inline_recursions.get()
    );
    outcome
}
