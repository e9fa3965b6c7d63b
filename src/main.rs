use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use virtualwatts::{cli::Cli, runtime};

/// Initialize tracing subscriber; logs go to stderr so stdout stays JSON
fn init_tracing(verbose: bool, debug: bool) {
    let level = if debug {
        tracing::Level::TRACE
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let debug = args.debug;
    let config = args.into_config()?;

    init_tracing(config.verbose, debug);

    // Ctrl+C and SIGTERM stop the pullers; buffered output is flushed on the way out
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        tracing::info!("Termination signal received");
        flag.store(true, Ordering::SeqCst);
    })
    .context("cannot install signal handler")?;

    let summary = runtime::run_until(&config, shutdown)?;
    if summary.puller_failures > 0 {
        tracing::warn!("{} input(s) stopped with an error", summary.puller_failures);
    }
    Ok(())
}
