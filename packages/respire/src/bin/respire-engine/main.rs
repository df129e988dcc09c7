//! The native execution engine binary.
//!
//! Consumes a root registry file and executes the build graph it
//! transitively describes. Events go to stdout as line-delimited JSON;
//! diagnostics go to stderr so the stream stays machine-readable.

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use color_eyre::Result;
use respire::engine::{self, EngineOptions, JsonLineSink};
use tracing_error::ErrorLayer;
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "respire-engine", about = "Respire build graph executor.")]
struct Cli {
    /// Maximum number of commands to run in parallel.
    #[arg(short = 'j', long, default_value_t = num_cpus::get())]
    jobs: usize,

    #[arg(short = 'v', long)]
    verbose: bool,

    /// The root registry file.
    root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let default = if cli.verbose {
        "respire=debug"
    } else {
        "respire=warn"
    };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var("RESPIRE_LOG")
        .try_from_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_writer(std::io::stderr)
                .with_targets(false)
                .with_filter(filter),
        )
        .init();

    let options = EngineOptions::new(&cli.root).jobs(cli.jobs);
    let mut sink = JsonLineSink(std::io::stdout().lock());
    let outcome = engine::run(&options, &mut sink).await?;

    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
