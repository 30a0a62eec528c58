//! Common utilities and types for the rdu disk usage tool
//!
//! This crate hosts the concurrent directory size aggregator together with everything the `rdu`
//! binary needs around it: the filesystem abstraction it walks, a local filesystem
//! implementation, progress tracking, configuration types and the [`run`] bootstrap which sets
//! up logging, the tokio runtime, throttling and progress reporting.
//!
//! # Core Modules
//!
//! - [`sizer`] - Concurrent size aggregation over a tree of directories
//! - [`node`] - The `Dir`/`File` capabilities the sizer relies on
//! - [`local`] - `Dir`/`File` over the local filesystem (`tokio::fs`)
//! - [`progress`] - Thread-local counters and a progress printer
//! - [`config`] - Runtime, throttling, output and progress configuration
//!
//! # Cancellation
//!
//! Every walk is driven by a `CancellationToken`. [`run`] cancels it on Ctrl-C; callers may
//! cancel it themselves, e.g. to implement a deadline. A cancelled walk stops all of its tasks
//! before returning [`sizer::Error::Cancelled`].
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> anyhow::Result<()> {
//! let progress = std::sync::Arc::new(common::progress::Progress::new());
//! let throttle = std::sync::Arc::new(throttle::Throttle::unlimited());
//! let summary = common::du(
//!     std::path::Path::new("/var/log"),
//!     &common::sizer::Settings { max_workers: 16 },
//!     &progress,
//!     &throttle,
//!     &tokio_util::sync::CancellationToken::new(),
//! )
//! .await?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```

use anyhow::Context;
use tracing::instrument;

pub mod config;
pub mod local;
pub mod node;
pub mod progress;
pub mod sizer;

#[cfg(test)]
pub mod testutils;

pub use config::{OutputConfig, ProgressSettings, ProgressType, RuntimeConfig, ThrottleConfig};
pub use sizer::size;

/// Shared handles passed to the closure executed by [`run`].
#[derive(Clone)]
pub struct Resources {
    pub progress: std::sync::Arc<progress::Progress>,
    pub throttle: std::sync::Arc<throttle::Throttle>,
    pub cancel: tokio_util::sync::CancellationToken,
}

/// Computes the size of `path` on the local filesystem.
///
/// A path which is not a directory (a file or a symlink) is reported as a single file.
#[instrument(skip(progress, throttle, cancel))]
pub async fn du(
    path: &std::path::Path,
    settings: &sizer::Settings,
    progress: &std::sync::Arc<progress::Progress>,
    throttle: &std::sync::Arc<throttle::Throttle>,
    cancel: &tokio_util::sync::CancellationToken,
) -> anyhow::Result<sizer::Summary> {
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", &path))?;
    if !metadata.is_dir() {
        progress.files_sized.inc();
        progress.bytes_found.add(metadata.len());
        return Ok(sizer::Summary {
            size: metadata.len(),
            count: 1,
        });
    }
    let summary = sizer::size(
        local::LocalDir::handle(path),
        settings,
        progress,
        throttle,
        cancel,
    )
    .await
    .with_context(|| format!("failed computing size of {:?}", &path))?;
    Ok(summary)
}

/// 80% of the soft `RLIMIT_NOFILE` limit, or 0 (no limit) if it cannot be determined.
pub fn default_max_open_files() -> usize {
    match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        Ok((soft, _hard)) => {
            let limit = usize::try_from(soft).unwrap_or(usize::MAX);
            std::cmp::min(limit / 10 * 8, tokio::sync::Semaphore::MAX_PERMITS)
        }
        Err(error) => {
            tracing::warn!("failed reading open files limit: {}", error);
            0
        }
    }
}

fn init_tracing(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_level()));
    // stdout carries the results, logs go next to the progress output
    let res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(error) = res {
        eprintln!("failed to initialize logging: {}", error);
    }
}

struct ProgressThread {
    stop: std::sync::mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

fn start_progress(
    settings: &ProgressSettings,
    progress: std::sync::Arc<progress::Progress>,
) -> anyhow::Result<ProgressThread> {
    let delay = settings.delay()?;
    let progress_type = settings.resolved_type();
    let (stop, stop_rx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || {
        let mut printer = progress::ProgressPrinter::new(&progress);
        let bar = if progress_type == ProgressType::ProgressBar {
            let bar = indicatif::ProgressBar::new_spinner();
            bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            Some(bar)
        } else {
            None
        };
        while let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = stop_rx.recv_timeout(delay) {
            match &bar {
                Some(bar) => {
                    bar.set_message(printer.print_line());
                    bar.tick();
                }
                None => match printer.print() {
                    Ok(text) => eprintln!("{}", text),
                    Err(error) => tracing::warn!("failed printing progress: {:#}", error),
                },
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
    });
    Ok(ProgressThread { stop, handle })
}

/// Sets up logging, the tokio runtime, throttling and progress reporting, then runs `func`.
///
/// Returns `None` if anything failed; errors are logged (unless quiet). The summary is printed to
/// stdout when requested in `output`.
pub fn run<Summary, Func, Fut>(
    progress_settings: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle_config: ThrottleConfig,
    func: Func,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Func: FnOnce(Resources) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    if let Err(error) = throttle_config.validate() {
        tracing::error!("invalid throttle configuration: {}", error);
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.worker_threads > 0 {
        builder.worker_threads(runtime.worker_threads);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed to start tokio runtime: {}", error);
            return None;
        }
    };
    let max_open_files = throttle_config
        .max_open_files
        .unwrap_or_else(default_max_open_files);
    let resources = Resources {
        progress: std::sync::Arc::new(progress::Progress::new()),
        throttle: std::sync::Arc::new(throttle::Throttle::new(
            max_open_files,
            throttle_config.ops_throttle,
        )),
        cancel: tokio_util::sync::CancellationToken::new(),
    };
    let progress_thread = match progress_settings
        .as_ref()
        .map(|settings| start_progress(settings, resources.progress.clone()))
        .transpose()
    {
        Ok(progress_thread) => progress_thread,
        Err(error) => {
            tracing::error!("{:#}", error);
            return None;
        }
    };
    let start_time = std::time::Instant::now();
    let res = tokio_runtime.block_on({
        let resources = resources.clone();
        async move {
            if resources.throttle.limits_ops() {
                let throttle = resources.throttle.clone();
                tokio::spawn(async move { throttle.run_replenish_thread().await });
            }
            let cancel = resources.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, cancelling");
                    cancel.cancel();
                }
            });
            func(resources).await
        }
    });
    if let Some(progress_thread) = progress_thread {
        // the receiving end only disappears if the thread already exited
        let _ = progress_thread.stop.send(());
        if progress_thread.handle.join().is_err() {
            tracing::warn!("progress thread panicked");
        }
    }
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{}", &summary);
                println!("walltime: {:.2?}", start_time.elapsed());
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", &error);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources() -> Resources {
        Resources {
            progress: std::sync::Arc::new(progress::Progress::new()),
            throttle: std::sync::Arc::new(throttle::Throttle::unlimited()),
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn du_of_single_file() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("file");
        tokio::fs::write(&path, "hello").await?;
        let res = resources();
        let summary = du(
            &path,
            &sizer::Settings::default(),
            &res.progress,
            &res.throttle,
            &res.cancel,
        )
        .await?;
        assert_eq!(summary, sizer::Summary { size: 5, count: 1 });
        Ok(())
    }

    #[tokio::test]
    async fn du_of_directory() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        tokio::fs::write(tmp_dir.path().join("a"), vec![0u8; 10]).await?;
        tokio::fs::write(tmp_dir.path().join("b"), vec![0u8; 20]).await?;
        tokio::fs::create_dir(tmp_dir.path().join("sub")).await?;
        tokio::fs::write(tmp_dir.path().join("sub").join("c"), vec![0u8; 7]).await?;
        let res = resources();
        for max_workers in [0, 1, 4] {
            let summary = du(
                tmp_dir.path(),
                &sizer::Settings { max_workers },
                &res.progress,
                &res.throttle,
                &res.cancel,
            )
            .await?;
            assert_eq!(summary, sizer::Summary { size: 37, count: 3 });
        }
        Ok(())
    }

    #[tokio::test]
    async fn du_of_missing_path() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let res = resources();
        let error = du(
            &tmp_dir.path().join("missing"),
            &sizer::Settings::default(),
            &res.progress,
            &res.throttle,
            &res.cancel,
        )
        .await
        .unwrap_err();
        assert!(format!("{:#}", error).contains("failed reading metadata"));
    }

    #[tokio::test]
    async fn du_reports_cancellation() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        tokio::fs::create_dir(tmp_dir.path().join("sub")).await?;
        let res = resources();
        res.cancel.cancel();
        let error = du(
            tmp_dir.path(),
            &sizer::Settings::default(),
            &res.progress,
            &res.throttle,
            &res.cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<sizer::Error>(),
            Some(sizer::Error::Cancelled)
        ));
        Ok(())
    }

    #[test]
    fn open_files_limit_is_bounded() {
        assert!(default_max_open_files() <= tokio::sync::Semaphore::MAX_PERMITS);
    }
}
