//! Resource throttling for filesystem walks
//!
//! A [`Throttle`] bounds the resources a single directory walk may consume. Unlike a set of
//! process-wide limits, every walk owns its own `Throttle` so that independent walks running in
//! the same process do not compete for each other's budget.
//!
//! # Overview
//!
//! Two limits are provided:
//!
//! 1. **Open Files Limit** - Controls the maximum number of directories being listed at once
//!    (every listing holds a file descriptor while it is read)
//! 2. **Operations Throttle** - Limits the number of filesystem operations (listings and size
//!    lookups) per second
//!
//! A limit of 0 disables the corresponding mechanism.
//!
//! # Usage
//!
//! ```rust,no_run
//! use throttle::Throttle;
//!
//! # async fn example() {
//! let throttle = std::sync::Arc::new(Throttle::new(8000, 500));
//! // the ops bucket must be refilled in the background
//! tokio::spawn({
//!     let throttle = throttle.clone();
//!     async move { throttle.run_replenish_thread().await }
//! });
//! throttle.get_ops_token().await;
//! let _guard = throttle.open_file_permit().await;
//! // list a directory here - the permit is released when the guard is dropped
//! # }
//! ```
//!
//! # Replenishment Strategy
//!
//! Operations are throttled with a token bucket. When the requested rate is a multiple of 10 the
//! bucket is refilled every 100ms with a tenth of the rate, otherwise it is refilled once a
//! second with the full rate. The bucket never holds more tokens than one refill.

mod semaphore;

const FINE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
const COARSE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Returns the number of tokens to add per interval and the interval itself for a given rate.
pub fn ops_schedule(ops_per_second: usize) -> (usize, std::time::Duration) {
    if ops_per_second >= 10 && ops_per_second % 10 == 0 {
        (ops_per_second / 10, FINE_INTERVAL)
    } else {
        (ops_per_second, COARSE_INTERVAL)
    }
}

pub struct Throttle {
    open_files: semaphore::Semaphore,
    ops: semaphore::Semaphore,
    ops_replenish: usize,
    ops_interval: std::time::Duration,
}

pub struct OpenFileGuard<'a> {
    _permit: Option<tokio::sync::SemaphorePermit<'a>>,
}

impl Throttle {
    pub fn new(max_open_files: usize, ops_per_second: usize) -> Self {
        let (ops_replenish, ops_interval) = ops_schedule(ops_per_second);
        tracing::debug!(
            "throttle: max open files: {}, ops: {} every {:?}",
            max_open_files,
            ops_replenish,
            ops_interval
        );
        Self {
            open_files: semaphore::Semaphore::new(max_open_files),
            ops: semaphore::Semaphore::new(ops_replenish),
            ops_replenish,
            ops_interval,
        }
    }

    /// A throttle which never blocks.
    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    pub fn limits_open_files(&self) -> bool {
        self.open_files.is_enabled()
    }

    pub fn limits_ops(&self) -> bool {
        self.ops.is_enabled()
    }

    pub async fn open_file_permit(&self) -> OpenFileGuard<'_> {
        OpenFileGuard {
            _permit: self.open_files.acquire().await,
        }
    }

    pub async fn get_ops_token(&self) {
        self.ops.consume().await;
    }

    /// Refills the ops bucket forever; returns immediately if ops are not throttled.
    pub async fn run_replenish_thread(&self) {
        self.ops
            .run_replenish_thread(self.ops_replenish, self.ops_interval)
            .await;
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::unlimited()
    }
}
