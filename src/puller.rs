//! Input collectors feeding reports to the formula worker
//!
//! Each puller runs on its own thread and sends decoded reports into a
//! crossbeam channel. The formula side only ever sees [`Message`]s; all I/O
//! stays here.
//!
//! - [`SocketPuller`]: TCP listener; every connection carries a stream of
//!   JSON documents, concatenated or newline-delimited.
//! - [`FilePuller`]: a file rewritten by a sensor at each sampling tick,
//!   holding one JSON document or an array of them.

use crate::config::PullerConfig;
use crate::formula::Message;
use crate::report::{Report, ReportKind};
use anyhow::{Context, Result};
use crossbeam::channel::Sender;
use std::io::{self, BufReader, Read};
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pause between two polls of an idle listener
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// A configured input, ready to run on its own thread
pub enum Puller {
    Socket(SocketPuller),
    File(FilePuller),
}

impl Puller {
    /// Build a puller from its configuration
    ///
    /// Sockets are bound here so that address errors surface before any
    /// thread is started.
    pub fn from_config(
        name: &str,
        config: &PullerConfig,
        stream: bool,
        interval: Duration,
    ) -> Result<Self> {
        let puller = match config {
            PullerConfig::Socket { model, uri, port } => Puller::Socket(
                SocketPuller::bind(name, *model, &format!("{}:{}", uri, port))?.stream(stream),
            ),
            PullerConfig::Filedb { model, filename } => Puller::File(
                FilePuller::new(name, *model, filename.clone())
                    .stream(stream)
                    .interval(interval),
            ),
        };
        Ok(puller)
    }

    pub fn name(&self) -> &str {
        match self {
            Puller::Socket(p) => &p.name,
            Puller::File(p) => &p.name,
        }
    }

    pub fn run(self, tx: Sender<Message>, shutdown: Arc<AtomicBool>) -> Result<()> {
        match self {
            Puller::Socket(p) => p.run(tx, shutdown),
            Puller::File(p) => p.run(tx, shutdown),
        }
    }
}

/// Decode every JSON document read from `reader` and forward it
///
/// Returns the number of reports forwarded. Documents that are valid JSON
/// but not a valid report are skipped; a syntax error ends the stream.
fn forward_stream<R: Read>(
    name: &str,
    model: ReportKind,
    reader: R,
    tx: &Sender<Message>,
) -> Result<usize> {
    let mut forwarded = 0;
    let documents = serde_json::Deserializer::from_reader(reader).into_iter::<serde_json::Value>();
    for document in documents {
        let value = match document {
            Ok(value) => value,
            Err(e) if e.is_eof() => break,
            Err(e) => {
                tracing::warn!("{}: malformed JSON stream, closing: {}", name, e);
                break;
            }
        };
        match model.decode(value) {
            Ok(report) => {
                if tx.send(Message::from(report)).is_err() {
                    tracing::debug!("{}: formula worker is gone", name);
                    break;
                }
                forwarded += 1;
            }
            Err(e) => tracing::warn!("{}: skipping report: {}", name, e),
        }
    }
    Ok(forwarded)
}

/// TCP listener decoding reports of a single model
pub struct SocketPuller {
    name: String,
    model: ReportKind,
    listener: TcpListener,
    stream: bool,
}

impl SocketPuller {
    /// Bind the listening socket (`port 0` picks a free port)
    pub fn bind(name: &str, model: ReportKind, addr: &str) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("{}: cannot bind {}", name, addr))?;
        Ok(Self {
            name: name.to_string(),
            model,
            listener,
            stream: false,
        })
    }

    /// In stream mode, accept connections forever; otherwise serve one
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections until shutdown (stream mode) or after the first one
    ///
    /// The listener is polled so that the shutdown flag is honored even
    /// while no client connects. Connections still open at shutdown are
    /// left to end with the process.
    pub fn run(self, tx: Sender<Message>, shutdown: Arc<AtomicBool>) -> Result<()> {
        tracing::info!(
            "{}: listening for {} on {}",
            self.name,
            self.model,
            self.local_addr()?
        );
        self.listener.set_nonblocking(true)?;

        let mut workers = Vec::new();
        while !shutdown.load(Ordering::SeqCst) {
            let (conn, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    reap(&self.name, &mut workers);
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("{}: accept failed: {}", self.name, e);
                    continue;
                }
            };
            conn.set_nonblocking(false)?;

            if !self.stream {
                let n = forward_stream(&self.name, self.model, BufReader::new(conn), &tx)?;
                tracing::info!("{}: {} reports received from {}", self.name, n, peer);
                return Ok(());
            }

            tracing::debug!("{}: connection from {}", self.name, peer);
            let tx = tx.clone();
            let name = self.name.clone();
            let model = self.model;
            workers.push(thread::spawn(move || {
                if let Err(e) = forward_stream(&name, model, BufReader::new(conn), &tx) {
                    tracing::warn!("{}: connection failed: {}", name, e);
                }
            }));
        }

        reap(&self.name, &mut workers);
        if !workers.is_empty() {
            tracing::info!("{}: {} connections still open at shutdown", self.name, workers.len());
        }
        Ok(())
    }
}

/// Join finished connection threads, logging the ones that panicked
fn reap(name: &str, workers: &mut Vec<JoinHandle<()>>) {
    let (done, running): (Vec<_>, Vec<_>) = workers.drain(..).partition(|w| w.is_finished());
    *workers = running;
    for worker in done {
        if worker.join().is_err() {
            tracing::error!("{}: connection handler panicked", name);
        }
    }
}

/// Polls a file rewritten by a sensor
pub struct FilePuller {
    name: String,
    model: ReportKind,
    path: PathBuf,
    interval: Duration,
    stream: bool,
    /// Timestamp of the last forwarded report
    last_timestamp: Option<u64>,
}

impl FilePuller {
    pub fn new(name: &str, model: ReportKind, path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            model,
            path,
            interval: Duration::from_millis(500),
            stream: false,
            last_timestamp: None,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// In stream mode, poll until shutdown; otherwise read the file once
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Read the file and return the reports not forwarded yet
    pub fn poll(&mut self) -> Result<Vec<Report>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("{}: cannot read {}", self.name, self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let value: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("{}: invalid JSON in {}", self.name, self.path.display()))?;
        let documents = match value {
            serde_json::Value::Array(items) => items,
            single => vec![single],
        };

        // Cutoff from the previous poll: the file may list reports in any order
        let cutoff = self.last_timestamp;
        let mut fresh = Vec::new();
        for document in documents {
            let report = match self.model.decode(document) {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!("{}: skipping report: {}", self.name, e);
                    continue;
                }
            };
            if cutoff.is_some_and(|last| report.timestamp() <= last) {
                continue;
            }
            fresh.push(report);
        }

        fresh.sort_by_key(Report::timestamp);
        if let Some(newest) = fresh.last() {
            self.last_timestamp = Some(newest.timestamp());
        }
        Ok(fresh)
    }

    pub fn run(mut self, tx: Sender<Message>, shutdown: Arc<AtomicBool>) -> Result<()> {
        tracing::info!(
            "{}: reading {} from {}",
            self.name,
            self.model,
            self.path.display()
        );

        if !self.stream {
            for report in self.poll()? {
                if tx.send(Message::from(report)).is_err() {
                    break;
                }
            }
            return Ok(());
        }

        while !shutdown.load(Ordering::Relaxed) {
            match self.poll() {
                Ok(reports) => {
                    for report in reports {
                        if tx.send(Message::from(report)).is_err() {
                            return Ok(());
                        }
                    }
                }
                // The sensor may not have written the file yet
                Err(e) => tracing::debug!("{:#}", e),
            }
            thread::sleep(self.interval);
        }
        Ok(())
    }
}
