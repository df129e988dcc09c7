//! The embeddable build driver.
//!
//! A build program registers its functions and record tags, routes
//! internal tool invocations, then hands control here:
//!
//! ```no_run
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     // respire::schema::register_function(...);
//!     if let Some(code) = respire::tools::run_internal_tool() {
//!         return code;
//!     }
//!     respire::driver::main("build.rs", "entry").await
//! }
//! ```
//!
//! The driver stages the root invocation's params and gen-registry, then
//! points the engine at the gen-registry; the engine takes it from there,
//! re-invoking this same program in host mode as the graph unfolds.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::{ExitCode, Stdio},
    time::Instant,
};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, instrument, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _, util::SubscriberInitExt};

use crate::{
    codec::Value,
    engine::{self, EngineOptions, Event, EventSink},
    fingerprint::log_directory,
    fs,
    host::HostSpec,
    progress::BuildProgress,
    registry::stage_invocation,
};

/// Name of the directory holding all generated build state.
pub const BUILD_FILES_DIR: &str = "__respire_build_files";

/// Standard driver arguments.
#[derive(Clone, Debug, Parser)]
#[command(about = "Entry point to a respire build.")]
pub struct DriverArgs {
    /// The out directory where all generated files will be placed.
    #[arg(short = 'o', long = "out_dir")]
    pub out_dir: PathBuf,

    /// Maximum number of jobs to run in parallel.
    #[arg(short = 'j', long, default_value_t = num_cpus::get())]
    pub jobs: usize,

    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Emit the build graph events for graph viewers.
    #[arg(short = 'g', long = "graph_view")]
    pub graph_view: bool,

    /// Dump the raw JSON event stream.
    #[arg(short = 'r', long = "raw_logs")]
    pub raw_logs: bool,

    /// Extra string parameters for the root build function.
    #[arg(value_name = "KEY=VALUE")]
    pub params: Vec<String>,
}

/// How the driver runs the engine.
#[derive(Clone, Debug, Default)]
pub enum EngineMode {
    /// Spawn the `respire-engine` binary (sibling of the current
    /// executable, or `$RESPIRE_ENGINE`).
    #[default]
    Binary,
    /// Run the engine inside this process. Used by embedders and tests.
    InProcess,
}

/// Resolved options for one driver run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub jobs: usize,
    pub raw_logs: bool,
    pub graph_view: bool,
    pub engine: EngineMode,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: num_cpus::get(),
            raw_logs: false,
            graph_view: false,
            engine: EngineMode::default(),
        }
    }
}

impl RunOptions {
    fn from_args(args: &DriverArgs) -> Self {
        Self {
            jobs: args.jobs.max(1),
            raw_logs: args.raw_logs,
            graph_view: args.graph_view,
            engine: EngineMode::default(),
        }
    }
}

/// Full driver main: parse the standard CLI, run the root build
/// function, and map the result to an exit code (0 success, 1 build
/// failure; clap itself exits 2 on invalid arguments).
pub async fn main(module: &str, function: &str) -> ExitCode {
    let _ = color_eyre::install();
    let args = DriverArgs::parse();
    init_tracing(args.verbose);

    let params = match parse_cli_params(&args.params) {
        Ok(params) => params,
        Err(err) => {
            eprintln!("Error: {err:?}");
            return ExitCode::from(2);
        }
    };

    match entry_point(module, function, &args, params).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

/// Run a root build function with the standard arguments. The out
/// directory is passed to the function as the `out_dir` parameter.
pub async fn entry_point(
    module: &str,
    function: &str,
    args: &DriverArgs,
    params: Value,
) -> Result<bool> {
    let out_dir = std::path::absolute(&args.out_dir).context("absolutize out dir")?;

    let mut merged = BTreeMap::new();
    merged.insert(
        "out_dir".to_owned(),
        Value::String(out_dir.to_string_lossy().into_owned()),
    );
    if let Some(members) = params.as_object() {
        for (key, value) in members {
            merged.insert(key.clone(), value.clone());
        }
    }

    run(
        &out_dir.join(BUILD_FILES_DIR),
        module,
        function,
        Value::Object(merged),
        &RunOptions::from_args(args),
    )
    .await
}

/// Stage the root invocation and run the engine over it.
#[instrument(skip_all, fields(module, function))]
pub async fn run(
    build_files_dir: &Path,
    module: &str,
    function: &str,
    params: Value,
    options: &RunOptions,
) -> Result<bool> {
    let start = Instant::now();
    fs::create_dir_all(build_files_dir)?;
    fs::create_dir_all(log_directory(build_files_dir))?;

    let host = HostSpec::current()?;
    let (paths, _) = stage_invocation(build_files_dir, &host, module, function, &params, &[])
        .context("stage root invocation")?;
    debug!(root = ?paths.gen_registry, "staged root invocation");

    let mut progress = BuildProgress::new();
    let success = match options.engine {
        EngineMode::InProcess => {
            let engine_options = EngineOptions::new(&paths.gen_registry).jobs(options.jobs);
            let mut sink = TeeSink {
                progress: &mut progress,
                raw: options.raw_logs || options.graph_view,
            };
            let outcome = engine::run(&engine_options, &mut sink).await?;
            outcome.success
        }
        EngineMode::Binary => {
            run_engine_binary(&paths.gen_registry, options, &mut progress).await?
        }
    };
    progress.finish();

    info!(
        elapsed = ?start.elapsed(),
        success,
        "build complete"
    );
    Ok(success)
}

/// Feeds events to the progress reporter, optionally echoing the raw
/// stream for the `-r`/`-g` flags.
struct TeeSink<'a> {
    progress: &'a mut BuildProgress,
    raw: bool,
}

impl EventSink for TeeSink<'_> {
    fn emit(&mut self, event: &Event) {
        if self.raw {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(%err, "unserializable event"),
            }
        }
        self.progress.emit(event);
    }
}

async fn run_engine_binary(
    root: &Path,
    options: &RunOptions,
    progress: &mut BuildProgress,
) -> Result<bool> {
    let engine = engine_binary()?;
    let mut command = tokio::process::Command::new(&engine);
    command
        .arg("-j")
        .arg(options.jobs.to_string())
        .arg(root)
        .stdout(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("spawn engine: {engine:?}"))?;
    let stdout = child.stdout.take().expect("engine stdout is piped");

    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await.context("read engine events")? {
        if options.raw_logs || options.graph_view {
            println!("{line}");
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => progress.emit(&event),
            Err(err) => warn!(%err, line, "unparseable engine event"),
        }
    }

    let status = child.wait().await.context("wait for engine")?;
    Ok(status.success())
}

fn engine_binary() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("RESPIRE_ENGINE") {
        return Ok(PathBuf::from(path));
    }
    let current = std::env::current_exe().context("resolve current executable")?;
    let sibling = current
        .parent()
        .map(|dir| dir.join("respire-engine"))
        .ok_or_else(|| eyre!("current executable has no parent directory"))?;
    if sibling.exists() {
        Ok(sibling)
    } else {
        bail!(
            "respire-engine not found at {sibling:?}; install it beside the build \
             program or set RESPIRE_ENGINE"
        );
    }
}

/// Parse trailing `key=value` CLI parameters into a parameter object.
pub fn parse_cli_params(pairs: &[String]) -> Result<Value> {
    let mut members = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got {pair:?}");
        };
        members.insert(key.to_owned(), Value::String(value.to_owned()));
    }
    Ok(Value::Object(members))
}

/// Initialize logging to stderr. The event stream owns stdout.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "respire=debug" } else { "respire=warn" };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var("RESPIRE_LOG")
        .try_from_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_writer(std::io::stderr)
                .with_targets(false)
                .with_filter(filter),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_key_value_params() {
        let params =
            parse_cli_params(&["config=debug".to_owned(), "target=arm".to_owned()]).unwrap();
        assert_eq!(params.str_field("config").unwrap(), "debug");
        assert_eq!(params.str_field("target").unwrap(), "arm");
    }

    #[test]
    fn rejects_malformed_params() {
        assert!(parse_cli_params(&["no-equals".to_owned()]).is_err());
    }
}
