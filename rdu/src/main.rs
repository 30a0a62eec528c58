use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rdu",
    version,
    about = "Compute disk usage of large directory trees efficiently - similar to `du -s`",
    long_about = "`rdu` sums the apparent sizes of all files below each given path, exploring
directories concurrently with a bounded number of tasks.

Only files (including symlinks, which are never followed) are counted; directories
themselves contribute neither size nor count.

EXAMPLE:
    # Size of a directory tree using at most 64 concurrent explorer tasks
    rdu /path/to/tree --max-workers 64 --progress

OUTPUT:
    One line per path: SIZE<TAB>FILES<TAB>PATH, or one JSON object per path with --json."
)]
struct Args {
    // Walk options
    /// Maximum number of concurrent explorer tasks, 0 means no limit
    ///
    /// Directories found while all explorer slots are taken are explored inline by the task
    /// that found them. With 1 the whole tree is explored by a single task.
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Walk options"
    )]
    max_workers: usize,

    /// Cancel the walk if it takes longer than this
    ///
    /// This option accepts a human readable duration, e.g. "500ms", "10s", "5min" etc.
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Walk options")]
    timeout: Option<std::time::Duration>,

    // Progress & output
    /// Print sizes as exact byte counts instead of human readable values
    #[arg(long, conflicts_with = "json", help_heading = "Progress & output")]
    bytes: bool,

    /// Print one JSON object per path
    #[arg(long, help_heading = "Progress & output")]
    json: bool,

    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of open files, 0 means no limit, leaving unspecified means using 80% of max open files system limit
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    /// Throttle the number of operations per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    worker_threads: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Path(s) to measure
    #[arg(default_value = ".")]
    paths: Vec<std::path::PathBuf>,
}

fn format_line(path: &std::path::Path, summary: &common::sizer::Summary, args: &Args) -> String {
    if args.json {
        return serde_json::json!({
            "path": path.display().to_string(),
            "size": summary.size,
            "count": summary.count,
        })
        .to_string();
    }
    let size = if args.bytes {
        summary.size.to_string()
    } else {
        bytesize::ByteSize(summary.size).to_string()
    };
    format!("{}\t{}\t{}", size, summary.count, path.display())
}

#[instrument(skip(resources))]
async fn async_main(args: Args, resources: common::Resources) -> Result<common::sizer::Summary> {
    if let Some(timeout) = args.timeout {
        let cancel = resources.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::warn!("timeout of {:?} reached, cancelling", timeout);
            cancel.cancel();
        });
    }
    let settings = common::sizer::Settings {
        max_workers: args.max_workers,
    };
    let mut join_set = tokio::task::JoinSet::new();
    for (index, path) in args.paths.iter().cloned().enumerate() {
        let resources = resources.clone();
        let do_du = || async move {
            let res = common::du(
                &path,
                &settings,
                &resources.progress,
                &resources.throttle,
                &resources.cancel,
            )
            .await;
            (index, path, res)
        };
        join_set.spawn(do_du());
    }
    let mut results = Vec::with_capacity(args.paths.len());
    while let Some(res) = join_set.join_next().await {
        results.push(res?);
    }
    // report in the order the paths were given
    results.sort_by_key(|(index, _, _)| *index);
    let mut success = true;
    let mut total = common::sizer::Summary::default();
    for (_, path, res) in results {
        match res {
            Ok(summary) => {
                println!("{}", format_line(&path, &summary, &args));
                total = total
                    .checked_add(summary)
                    .ok_or_else(|| anyhow!("total size of all paths overflowed"))?;
            }
            Err(error) => {
                tracing::error!("{:#}", &error);
                success = false;
            }
        }
    }
    if !success {
        if args.summary {
            return Err(anyhow!("rdu encountered errors\n\n{}", &total));
        }
        return Err(anyhow!("rdu encountered errors"));
    }
    Ok(total)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        |resources| async_main(args, resources)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        worker_threads: args.worker_threads,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        ops_throttle: args.ops_throttle,
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
