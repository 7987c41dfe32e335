//! Entry point for the uvm protector.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Install the `tracing` subscriber.
//! 3. Run the compiler: load, select, decode, virtualize, lay out, resolve, write.
//! 4. Map the outcome to the process exit status.
//!
//! Error handling is done via `anyhow`.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use uvm::compiler::{AbortFlag, Compiler, Status};
use uvm::config::Config;
use uvm::log::TracingLog;
use uvm::watermark::FramedSigner;

fn run(config: &Config) -> Result<Status> {
    if !config.input.is_file() {
        anyhow::bail!("input {} does not exist", config.input.display());
    }
    let output = config.output_path();
    let log = TracingLog::new();
    let abort = AbortFlag::new();
    let mut compiler = Compiler::new(config.compile_options(), config.profile(), &log, &abort, &FramedSigner);

    let summary = compiler
        .compile(&config.input, &output)
        .with_context(|| format!("failed to protect {}", config.input.display()))?;

    tracing::info!(
        selected = summary.selected,
        virtualized = summary.virtualized,
        rejected = summary.rejected,
        fallbacks = summary.fallbacks,
        decode_failures = summary.decode_failures,
        fixups = summary.fixups,
        "protected {}",
        output.display()
    );
    Ok(summary.status())
}

fn main() -> ExitCode {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match run(&config) {
        Ok(status) => ExitCode::from(status.code()),
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
