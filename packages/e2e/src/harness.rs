//! Test directories, execution-count tracking, and the test tools.
//!
//! Commands in scenarios run through `tool-cat`/`tool-echo` subcommands
//! of the scenario binary itself, keeping the suite portable. Each tool
//! bumps a count-marker directory when asked, which is how scenarios
//! observe how many times a command actually executed without trusting
//! the engine's own accounting.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use color_eyre::{Result, eyre::Context};
use respire::{
    Value,
    driver::{self, EngineMode, RunOptions},
    fs, params,
};

use crate::functions;

/// A fresh sandbox: `source/` for scenario inputs, `out/` for build
/// products, `respire_out/` for the build-files directory.
pub struct TestDirs {
    _temp: tempfile::TempDir,
    pub source: PathBuf,
    pub out: PathBuf,
    pub respire_out: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create test sandbox")?;
        let source = temp.path().join("source");
        let out = temp.path().join("out");
        let respire_out = temp.path().join("respire_out");
        fs::create_dir_all(&source)?;
        fs::create_dir_all(&out)?;
        fs::create_dir_all(&respire_out)?;
        Ok(Self {
            _temp: temp,
            source,
            out,
            respire_out,
        })
    }

    pub fn out_str(&self) -> String {
        self.out.to_string_lossy().into_owned()
    }
}

/// Run a build function through the real driver, with the engine in
/// process and hosts as subprocesses of this binary.
pub async fn run_respire(
    dirs: &TestDirs,
    module: &str,
    function: &str,
    forward_params: Value,
    targets: &[PathBuf],
) -> Result<bool> {
    let params = params! {
        "build_module" => module,
        "build_function" => function,
        "forward_params" => forward_params,
        "targets" => targets
            .iter()
            .map(|target| target.to_string_lossy().into_owned())
            .collect::<Vec<_>>(),
    };
    driver::run(
        &dirs.respire_out,
        functions::DRIVER_MODULE,
        "driver_step",
        params,
        &RunOptions {
            jobs: 4,
            engine: EngineMode::InProcess,
            ..RunOptions::default()
        },
    )
    .await
}

/// How many times the command owning this count directory has executed.
pub fn count(count_dir: &Path) -> usize {
    match std::fs::read_dir(count_dir) {
        Ok(entries) => entries.filter_map(|entry| entry.ok()).count(),
        Err(_) => 0,
    }
}

/// Record one execution in a count-marker directory.
pub fn add_count(count_dir: &Path) -> Result<()> {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    fs::create_dir_all(count_dir)?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let marker = format!(
        "{}_{}_{}",
        std::process::id(),
        nanos,
        SEQUENCE.fetch_add(1, Ordering::Relaxed),
    );
    fs::write_atomic(count_dir.join(marker), "")?;
    Ok(())
}

const NO_COUNT: &str = "-";

fn current_exe_token() -> String {
    std::env::current_exe()
        .expect("scenario binary path is resolvable")
        .to_string_lossy()
        .into_owned()
}

/// Build a `tool-cat` command line: concatenate inputs into an output.
pub fn cat_command(inputs: &[String], output: &str, count_dir: Option<&str>) -> Vec<String> {
    let mut command = vec![
        current_exe_token(),
        "tool-cat".to_owned(),
        output.to_owned(),
        count_dir.unwrap_or(NO_COUNT).to_owned(),
    ];
    command.extend(inputs.iter().cloned());
    command
}

/// Build a `tool-echo` command line: write a literal string to a file.
pub fn echo_command(text: &str, output: &str, count_dir: Option<&str>) -> Vec<String> {
    vec![
        current_exe_token(),
        "tool-echo".to_owned(),
        output.to_owned(),
        count_dir.unwrap_or(NO_COUNT).to_owned(),
        text.to_owned(),
    ]
}

/// Dispatch the test tools. Call after `respire::tools::run_internal_tool`.
pub fn run_test_tool() -> Option<ExitCode> {
    let args: Vec<String> = std::env::args().collect();
    let tool = args.get(1).map(String::as_str);
    let result = match tool {
        Some("tool-cat") => cat_tool(&args[2..]),
        Some("tool-echo") => echo_tool(&args[2..]),
        _ => return None,
    };
    Some(match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    })
}

fn cat_tool(args: &[String]) -> Result<()> {
    let [output, count_dir, inputs @ ..] = args else {
        color_eyre::eyre::bail!("usage: tool-cat <output> <count-dir|-> <inputs...>");
    };
    let mut combined = String::new();
    for input in inputs {
        combined.push_str(&fs::read_to_string(input)?);
    }
    fs::write_atomic(output, &combined)?;
    bump(count_dir)
}

fn echo_tool(args: &[String]) -> Result<()> {
    let [output, count_dir, text] = args else {
        color_eyre::eyre::bail!("usage: tool-echo <output> <count-dir|-> <text>");
    };
    fs::write_atomic(output, text)?;
    bump(count_dir)
}

fn bump(count_dir: &str) -> Result<()> {
    if count_dir != NO_COUNT {
        add_count(Path::new(count_dir))?;
    }
    Ok(())
}
