//! Wiring of pullers, formula worker and pushers for one run
//!
//! ```text
//! puller threads ──Message──▶ bounded channel ──▶ dispatcher (calling thread) ──▶ pushers
//! ```
//!
//! The dispatcher and its formulas are owned by a single thread, so pairing
//! and attribution of one report always complete before the next report is
//! taken from the channel. Pullers only share the channel sender.
//!
//! Batch runs (inputs read once) collect every report first and replay them
//! in timestamp order: each input is drained by its own thread, so arrival
//! order says nothing about sampling time. Streaming runs process reports
//! as they arrive until the shutdown flag is raised.

use crate::config::{Config, PusherConfig};
use crate::dispatcher::Dispatcher;
use crate::formula::{FormulaStats, Message};
use crate::puller::Puller;
use crate::pusher::{CsvPusher, JsonPusher, Pusher};
use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Maximum number of decoded reports waiting for the formula
pub const CHANNEL_CAPACITY: usize = 1024;

/// How long the worker waits on the channel before checking for shutdown
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Outcome of a completed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub stats: FormulaStats,
    /// Pullers that stopped with an error
    pub puller_failures: usize,
    /// Power sensors that got a formula
    pub sensors: usize,
}

/// Instantiate the configured pushers
pub fn build_pushers(outputs: &BTreeMap<String, PusherConfig>) -> Result<Vec<Box<dyn Pusher>>> {
    let mut pushers: Vec<Box<dyn Pusher>> = Vec::with_capacity(outputs.len());
    for (name, output) in outputs {
        let pusher: Box<dyn Pusher> = match output {
            PusherConfig::Json { filename: None } => Box::new(JsonPusher::stdout(name.as_str())),
            PusherConfig::Json {
                filename: Some(path),
            } => Box::new(
                JsonPusher::create(name.as_str(), path)
                    .with_context(|| format!("cannot create output {}", path.display()))?,
            ),
            PusherConfig::Csv { filename } => Box::new(
                CsvPusher::create(name.as_str(), filename)
                    .with_context(|| format!("cannot create output {}", filename.display()))?,
            ),
        };
        pushers.push(pusher);
    }
    Ok(pushers)
}

/// Run VirtualWatts until every puller has finished
pub fn run(config: &Config) -> Result<RunSummary> {
    run_until(config, Arc::new(AtomicBool::new(false)))
}

/// Run VirtualWatts until every puller has finished or `shutdown` is raised
///
/// Returns an error for invalid configuration, unusable inputs/outputs, or a
/// fatal formula error. Non-fatal formula errors are logged and skipped.
/// Pushers are flushed on every exit path once the worker has started.
pub fn run_until(config: &Config, shutdown: Arc<AtomicBool>) -> Result<RunSummary> {
    config.validate()?;
    let formula_config = config.formula_config();
    let flush_every = formula_config.sampling_interval;

    let pushers = build_pushers(&config.output)?;
    let mut pullers = Vec::with_capacity(config.input.len());
    for (name, input) in &config.input {
        pullers.push(Puller::from_config(
            name,
            input,
            config.stream,
            formula_config.sampling_interval,
        )?);
    }

    tracing::info!(
        "Starting VirtualWatts: delay threshold {:?}, normalizer {}",
        formula_config.delay_threshold,
        formula_config.normalizer
    );
    let mut dispatcher = Dispatcher::new(formula_config, pushers);

    let (tx, rx) = bounded::<Message>(CHANNEL_CAPACITY);
    let handles: Vec<(String, JoinHandle<Result<()>>)> = pullers
        .into_iter()
        .map(|puller| {
            let name = puller.name().to_string();
            let tx = tx.clone();
            let shutdown = Arc::clone(&shutdown);
            (name, thread::spawn(move || puller.run(tx, shutdown)))
        })
        .collect();
    drop(tx);

    let outcome = if config.stream {
        drive(&mut dispatcher, &rx, &shutdown, flush_every)
    } else {
        replay(&mut dispatcher, collect_batch(&rx, &shutdown))
    };
    dispatcher.flush();
    shutdown.store(true, Ordering::SeqCst);
    outcome?;

    let mut puller_failures = 0;
    for (name, handle) in handles {
        match handle.join() {
            Ok(Ok(())) => tracing::debug!("{} finished", name),
            Ok(Err(e)) => {
                tracing::error!("Puller {} failed: {:#}", name, e);
                puller_failures += 1;
            }
            Err(_) => {
                tracing::error!("Puller {} panicked", name);
                puller_failures += 1;
            }
        }
    }

    let stats = dispatcher.stats();
    tracing::info!(
        received = stats.received,
        emitted = stats.emitted,
        evicted = stats.sync.evicted,
        "VirtualWatts is shutting down"
    );
    Ok(RunSummary {
        stats,
        puller_failures,
        sensors: dispatcher.sensors().len(),
    })
}

/// Hand one message to the dispatcher; only fatal errors are returned
fn dispatch(dispatcher: &mut Dispatcher, message: Message) -> Result<()> {
    match dispatcher.on_message(message) {
        Ok(_) => Ok(()),
        Err(e) if e.is_fatal() => Err(e).context("formula worker stopped"),
        Err(e) => {
            tracing::warn!("{}", e);
            Ok(())
        }
    }
}

/// Process messages as they arrive until every sender is gone or shutdown
///
/// Pushers are flushed at least every `flush_every`, idle or not.
pub fn drive(
    dispatcher: &mut Dispatcher,
    rx: &Receiver<Message>,
    shutdown: &AtomicBool,
    flush_every: Duration,
) -> Result<()> {
    let mut last_flush = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(message) => dispatch(dispatcher, message)?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
        if last_flush.elapsed() >= flush_every {
            dispatcher.flush();
            last_flush = Instant::now();
        }
    }
    tracing::info!("Shutdown requested, {} reports left unread", rx.len());
    Ok(())
}

/// Drain the channel and order the reports by timestamp
///
/// The sort is stable, and power reports go before usage reports sampled
/// at the same millisecond.
pub fn collect_batch(rx: &Receiver<Message>, shutdown: &AtomicBool) -> Vec<Message> {
    let mut batch = Vec::new();
    loop {
        match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(message) => batch.push(message),
            Err(RecvTimeoutError::Timeout) if shutdown.load(Ordering::SeqCst) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    batch.sort_by_key(|m| (m.timestamp(), matches!(m, Message::Procfs(_))));
    tracing::debug!("Replaying {} reports", batch.len());
    batch
}

/// Feed an already ordered batch to the dispatcher
pub fn replay(dispatcher: &mut Dispatcher, batch: Vec<Message>) -> Result<()> {
    for message in batch {
        dispatch(dispatcher, message)?;
    }
    Ok(())
}
