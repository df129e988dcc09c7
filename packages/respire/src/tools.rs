//! Internal tool dispatch for generated commands.
//!
//! Build functions are compiled into the embedding binary, so the
//! commands the system generates (run a build function, flatten an
//! output, run a callback) re-invoke that same binary with an internal
//! subcommand. Embedders call [`run_internal_tool`] first thing in
//! `main`, before their own CLI:
//!
//! ```no_run
//! fn main() -> std::process::ExitCode {
//!     // register build functions and record tags ...
//!     if let Some(code) = respire::tools::run_internal_tool() {
//!         return code;
//!     }
//!     // ... normal driver CLI
//!     std::process::ExitCode::SUCCESS
//! }
//! ```

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use color_eyre::Result;

use crate::host::{self, HostInvocation};

#[derive(Debug, Parser)]
#[command(name = "respire-tool", disable_help_subcommand = true)]
struct ToolCli {
    #[command(subcommand)]
    tool: Tool,
}

#[derive(Debug, clap::Subcommand)]
enum Tool {
    /// Run one build function as a subrespire host.
    Host {
        /// Module identifier of the build function.
        #[arg(short = 'b', long)]
        build_module: String,
        /// Name of the build function.
        #[arg(short = 'f', long)]
        function: String,
        /// Staged canonical params file.
        #[arg(short = 'p', long)]
        params_file: PathBuf,
        /// The build-files directory.
        #[arg(short = 'o', long)]
        out_dir: PathBuf,
        /// Touched on success; its absence re-runs the invocation.
        #[arg(short = 't', long)]
        timestamp_file: Option<PathBuf>,
    },
    /// Resolve futures in an output file.
    Flatten { output: PathBuf, flattened: PathBuf },
    /// Copy a future-free output to its flattened path.
    Copy { src: PathBuf, dst: PathBuf },
    /// Run a registered callback with staged params.
    Call {
        module: String,
        function: String,
        params_file: PathBuf,
        deps_file: PathBuf,
    },
}

/// Detect and run an internal tool invocation.
///
/// Returns `None` when the process was not invoked as a tool, in which
/// case the embedder's own CLI proceeds. Tool names are checked before
/// clap parses, so embedder argument conventions are unaffected.
pub fn run_internal_tool() -> Option<ExitCode> {
    let is_tool = matches!(
        std::env::args().nth(1).as_deref(),
        Some("host" | "flatten" | "copy" | "call"),
    );
    if !is_tool {
        return None;
    }

    let _ = color_eyre::install();
    let cli = ToolCli::parse();
    Some(match run(cli.tool) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    })
}

fn run(tool: Tool) -> Result<()> {
    match tool {
        Tool::Host {
            build_module,
            function,
            params_file,
            out_dir,
            timestamp_file,
        } => host::run_subrespire(&HostInvocation {
            module: build_module,
            function,
            params_file,
            out_dir,
            timestamp_file,
        }),
        Tool::Flatten { output, flattened } => host::flatten_output_file(&output, &flattened),
        Tool::Copy { src, dst } => host::copy_output_file(&src, &dst),
        Tool::Call {
            module,
            function,
            params_file,
            deps_file,
        } => host::run_callback(&module, &function, &params_file, &deps_file),
    }
}
