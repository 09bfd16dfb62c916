//! tidesync: mirror a local directory to S3
//!
//! Usage:
//!   tidesync <LOCAL_PATH> s3://bucket[/prefix] [--delete] [--dryrun] [--exclude PATTERN]...
//!
//! The run plans first (scan, list, compare, fingerprint) and then applies the
//! plan with bounded concurrency. `--dryrun` prints the plan and stops.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use tidesync_core::config::TidesyncConfig;
use tidesync_core::{Action, ExecutionResult, PlanItem, RemoteLocation};
use tidesync_storage::{
    NativeChecksums, ObjectStore, OpendalStore, Retrier, RetryPolicy, RetryingStore,
};
use tidesync_sync::report::write_json;
use tidesync_sync::{
    ExecutionObserver, Executor, ExecutorOptions, PlanOptions, PlanReport, Planner, ResultReport,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tidesync",
    version,
    about = "Mirror a local directory to S3",
    long_about = "tidesync: upload new and changed files to an S3 prefix, \
                  optionally deleting objects with no local counterpart"
)]
struct Cli {
    /// Local directory to mirror
    local: PathBuf,

    /// Destination, s3://bucket[/prefix]
    #[arg(value_name = "S3_URI")]
    s3_uri: String,

    /// Skip paths matching this shell pattern (repeatable)
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Delete remote objects that no longer exist locally
    #[arg(long)]
    delete: bool,

    /// Print the plan without changing anything
    #[arg(long)]
    dryrun: bool,

    /// Concurrent transfers (default: 32)
    #[arg(long)]
    concurrency: Option<usize>,

    /// AWS shared-config profile for credentials
    #[arg(long)]
    profile: Option<String>,

    /// AWS region (falls back to AWS_REGION, then us-east-1)
    #[arg(long)]
    region: Option<String>,

    /// S3-compatible endpoint URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Suppress per-file output and lower the default log level to warn;
    /// errors are still printed
    #[arg(long, short = 'q')]
    quiet: bool,

    /// Write the plan as JSON to this file
    #[arg(long, value_name = "PATH")]
    plan_json_file: Option<PathBuf>,

    /// Write execution results as JSON to this file (ignored with --dryrun)
    #[arg(long, value_name = "PATH")]
    result_json_file: Option<PathBuf>,

    /// Path to a tidesync.toml configuration file
    #[arg(long, short = 'c', env = "TIDESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TIDESYNC_LOG")]
    log: Option<String>,

    /// Log format
    #[arg(long, env = "TIDESYNC_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match resolve_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // The credential loader reads AWS_PROFILE; export it before any threads start.
    // An explicit flag wins over the environment, which wins over the config file.
    match (&cli.profile, &settings.config.storage.profile) {
        (Some(profile), _) => std::env::set_var("AWS_PROFILE", profile),
        (None, Some(profile)) if std::env::var_os("AWS_PROFILE").is_none() => {
            std::env::set_var("AWS_PROFILE", profile)
        }
        _ => {}
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: starting async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli, settings)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Resolved settings: config file first, flags on top
struct Settings {
    config: TidesyncConfig,
    location: RemoteLocation,
    excludes: Vec<String>,
    concurrency: usize,
}

fn resolve_settings(cli: &Cli) -> Result<Settings> {
    let mut config = match &cli.config {
        Some(path) => TidesyncConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => TidesyncConfig::default(),
    };
    if cli.region.is_some() {
        config.storage.region = cli.region.clone();
    }
    if cli.endpoint.is_some() {
        config.storage.endpoint = cli.endpoint.clone();
    }
    if cli.profile.is_some() {
        config.storage.profile = cli.profile.clone();
    }
    config.log.level = log_level(cli, &config.log.level);

    let location = RemoteLocation::parse(&cli.s3_uri)?;
    let mut excludes = config.sync.exclude_patterns.clone();
    excludes.extend(cli.exclude.iter().cloned());
    let concurrency = cli.concurrency.unwrap_or(config.sync.concurrency).max(1);

    Ok(Settings {
        config,
        location,
        excludes,
        concurrency,
    })
}

const DEFAULT_LOG_LEVEL: &str = "info";

/// `--log` wins; otherwise `--quiet` turns the stock info level into warn.
/// `RUST_LOG` still overrides whatever this returns.
fn log_level(cli: &Cli, configured: &str) -> String {
    match &cli.log {
        Some(level) => level.clone(),
        None if cli.quiet && configured.eq_ignore_ascii_case(DEFAULT_LOG_LEVEL) => "warn".into(),
        None => configured.to_string(),
    }
}

/// Returns whether every item succeeded
async fn run(cli: Cli, settings: Settings) -> Result<bool> {
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| LogFormat::from_config(&settings.config.log.format));
    init_logging(&settings.config.log.level, &format);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        local = %cli.local.display(),
        remote = %settings.location,
        dryrun = cli.dryrun,
        "tidesync starting"
    );
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling outstanding work");
                cancel.cancel();
            }
        });
    }

    let store = build_store(&settings, &cancel)?;
    let planner = Planner::from_config(store.clone(), &settings.config.sync);
    let options = PlanOptions {
        delete: cli.delete,
        excludes: settings.excludes.clone(),
    };

    let spinner = (!cli.quiet).then(|| make_spinner("plan"));
    if let Some(pb) = &spinner {
        pb.set_message(format!("comparing {} with {}", cli.local.display(), settings.location));
    }
    let planned = planner
        .plan(&cancel, &cli.local, &settings.location, &options)
        .await;
    if let Some(pb) = &spinner {
        pb.finish_and_clear();
    }
    let plan = planned.with_context(|| {
        format!("planning {} -> {}", cli.local.display(), settings.location)
    })?;

    if let Some(path) = &cli.plan_json_file {
        write_json(path, &PlanReport::from_plan(&plan, &settings.location))
            .with_context(|| format!("writing plan to {}", path.display()))?;
    }

    if cli.dryrun {
        if !cli.quiet {
            for item in &plan {
                println!("(dryrun) {}", console_line(item, &settings.location));
            }
        }
        tracing::info!(actions = plan.len(), "dry run complete, nothing changed");
        return Ok(true);
    }

    let results = execute(&cli, &settings, store, &cancel, plan).await;
    let report = ResultReport::from_results(&results, &settings.location);
    if let Some(path) = &cli.result_json_file {
        write_json(path, &report)
            .with_context(|| format!("writing results to {}", path.display()))?;
    }

    tracing::info!(
        created = report.summary.created,
        updated = report.summary.updated,
        deleted = report.summary.deleted,
        failed = report.summary.failed,
        "sync complete"
    );
    Ok(!report.has_failures())
}

fn build_store(settings: &Settings, cancel: &CancellationToken) -> Result<Arc<dyn ObjectStore>> {
    let storage = &settings.config.storage;
    let opts = tidesync_storage::s3_options(storage, &settings.location.bucket)
        .with_context(|| format!("connecting to {}", settings.location))?;
    let op = tidesync_storage::build_operator(&opts)
        .with_context(|| format!("connecting to {}", settings.location))?;
    let name = match &storage.endpoint {
        Some(endpoint) => format!("{endpoint} ({})", settings.location.bucket),
        None => format!("s3://{}", settings.location.bucket),
    };
    let mut inner = OpendalStore::new(op, name, storage.part_concurrency);
    if storage.native_checksums {
        inner = inner.with_native_checksums(
            NativeChecksums::new(&opts).context("building native checksum client")?,
        );
    }
    let retrier = Retrier::new(RetryPolicy::from_config(&settings.config.retry));
    Ok(Arc::new(RetryingStore::new(inner, retrier, cancel.clone())))
}

async fn execute(
    cli: &Cli,
    settings: &Settings,
    store: Arc<dyn ObjectStore>,
    cancel: &CancellationToken,
    plan: Vec<PlanItem>,
) -> Vec<ExecutionResult> {
    let progress =
        (!cli.quiet && !plan.is_empty()).then(|| make_progress_bar(plan.len() as u64, "sync"));
    let observer = Arc::new(ConsoleObserver {
        location: settings.location.clone(),
        quiet: cli.quiet,
        progress: progress.clone(),
    });

    let opts = ExecutorOptions {
        concurrency: settings.concurrency,
        multipart_threshold: settings.config.sync.multipart_threshold_bytes(),
    };
    let results = Executor::new(store, opts)
        .with_observer(observer)
        .with_session_retrier(Retrier::new(RetryPolicy::from_config(&settings.config.retry)))
        .execute(cancel, plan)
        .await;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    results
}

// ── Console output ─────────────────────────────────────────────────────────────

/// `upload: <local> to s3://bucket/key` or `delete: s3://bucket/key`
fn console_line(item: &PlanItem, location: &RemoteLocation) -> String {
    let target = location.target(&item.remote_key);
    match (item.action, item.local_path.as_deref()) {
        (Action::Upload, Some(local)) => format!("upload: {} to {target}", local.display()),
        (Action::Upload, None) => format!("upload: {target}"),
        (Action::Delete, _) => format!("delete: {target}"),
    }
}

/// Prints one line per finished item, above the progress bar
struct ConsoleObserver {
    location: RemoteLocation,
    quiet: bool,
    progress: Option<ProgressBar>,
}

impl ConsoleObserver {
    fn emit(&self, print: impl FnOnce()) {
        match &self.progress {
            Some(pb) => pb.suspend(print),
            None => print(),
        }
    }
}

impl ExecutionObserver for ConsoleObserver {
    fn started(&self, item: &PlanItem) {
        if let Some(pb) = &self.progress {
            pb.set_message(display_name(&item.remote_key).to_string());
        }
    }

    fn finished(&self, result: &ExecutionResult) {
        let line = console_line(&result.item, &self.location);
        match &result.error {
            None if !self.quiet => self.emit(|| println!("{line}")),
            None => {}
            Some(err) => self.emit(|| eprintln!("{}: {err}", failed_line(&line))),
        }
        if let Some(pb) = &self.progress {
            pb.inc(1);
        }
    }
}

/// `upload: a to b` -> `upload failed: a to b`
fn failed_line(line: &str) -> String {
    match line.split_once(": ") {
        Some((action, rest)) => format!("{action} failed: {rest}"),
        None => format!("failed: {line}"),
    }
}

fn display_name(key: &str) -> &str {
    Path::new(key)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(key)
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}
