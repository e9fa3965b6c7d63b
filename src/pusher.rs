//! Output sinks for attributed power reports
//!
//! The formula hands every report to every configured pusher. Delivery is
//! fire-and-forget: a pusher error is logged by the caller and never stops
//! delivery to the other pushers.
//!
//! File pushers write through a `BufWriter`. The runtime flushes them once
//! per sampling interval while streaming and again on shutdown, so at most
//! one interval of output sits in memory.

use crate::report::{PowerReport, CSV_HEADER_POWER};
use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors raised by pushers
#[derive(Error, Debug)]
pub enum PusherError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pusher {0} is closed")]
    Closed(String),
}

/// Destination for attributed power reports
pub trait Pusher: Send {
    /// Name used in logs and configuration
    fn name(&self) -> &str;

    fn push(&mut self, report: &PowerReport) -> Result<(), PusherError>;

    fn flush(&mut self) -> Result<(), PusherError> {
        Ok(())
    }
}

/// Writes one compact JSON document per line
pub struct JsonPusher<W: Write + Send> {
    name: String,
    writer: W,
}

impl<W: Write + Send> JsonPusher<W> {
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonPusher<io::Stdout> {
    pub fn stdout(name: impl Into<String>) -> Self {
        Self::new(name, io::stdout())
    }
}

impl JsonPusher<BufWriter<File>> {
    /// Create (or truncate) `path` and write reports to it
    pub fn create(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, PusherError> {
        let file = File::create(path)?;
        Ok(Self::new(name, BufWriter::new(file)))
    }
}

impl<W: Write + Send> Pusher for JsonPusher<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&mut self, report: &PowerReport) -> Result<(), PusherError> {
        serde_json::to_writer(&mut self.writer, report)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PusherError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes reports as CSV rows, header first
pub struct CsvPusher<W: Write + Send> {
    name: String,
    writer: W,
    header_written: bool,
}

impl<W: Write + Send> CsvPusher<W> {
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Quote a name that would otherwise break the row
    ///
    /// Targets are process keys taken verbatim from the usage sensor, so
    /// cgroup paths or command lines may carry CSV separators.
    fn quote(field: &str) -> Cow<'_, str> {
        if field.contains([',', '"', '\n', '\r']) {
            Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
        } else {
            Cow::Borrowed(field)
        }
    }

    fn format_report(report: &PowerReport) -> String {
        [
            report.timestamp.to_string(),
            Self::quote(&report.sensor).into_owned(),
            Self::quote(&report.target).into_owned(),
            report.power.to_string(),
        ]
        .join(",")
    }
}

impl CsvPusher<BufWriter<File>> {
    pub fn create(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, PusherError> {
        let file = File::create(path)?;
        Ok(Self::new(name, BufWriter::new(file)))
    }
}

impl<W: Write + Send> Pusher for CsvPusher<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&mut self, report: &PowerReport) -> Result<(), PusherError> {
        if !self.header_written {
            writeln!(self.writer, "{}", CSV_HEADER_POWER.join(","))?;
            self.header_written = true;
        }
        writeln!(self.writer, "{}", Self::format_report(report))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PusherError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps reports in memory behind a shared handle
///
/// # Example
/// ```
/// use virtualwatts::pusher::{MemoryPusher, Pusher};
/// use virtualwatts::report::PowerReport;
///
/// let mut pusher = MemoryPusher::new("memory");
/// let reports = pusher.handle();
/// pusher.push(&PowerReport::new(0, "virtualwatts", "t1", 1.5)).unwrap();
/// assert_eq!(reports.lock().unwrap().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryPusher {
    name: String,
    reports: Arc<Mutex<Vec<PowerReport>>>,
}

impl MemoryPusher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reports: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared view of every report pushed so far
    pub fn handle(&self) -> Arc<Mutex<Vec<PowerReport>>> {
        Arc::clone(&self.reports)
    }
}

impl Pusher for MemoryPusher {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&mut self, report: &PowerReport) -> Result<(), PusherError> {
        self.reports
            .lock()
            .map_err(|_| PusherError::Closed(self.name.clone()))?
            .push(report.clone());
        Ok(())
    }
}

/// Pusher handle shared by the formulas of several sensors
///
/// Every clone writes to the same underlying pusher.
#[derive(Clone)]
pub struct SharedPusher {
    name: String,
    inner: Arc<Mutex<Box<dyn Pusher>>>,
}

impl SharedPusher {
    pub fn new(pusher: Box<dyn Pusher>) -> Self {
        Self {
            name: pusher.name().to_string(),
            inner: Arc::new(Mutex::new(pusher)),
        }
    }
}

impl Pusher for SharedPusher {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&mut self, report: &PowerReport) -> Result<(), PusherError> {
        self.inner
            .lock()
            .map_err(|_| PusherError::Closed(self.name.clone()))?
            .push(report)
    }

    fn flush(&mut self) -> Result<(), PusherError> {
        self.inner
            .lock()
            .map_err(|_| PusherError::Closed(self.name.clone()))?
            .flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(target: &str, power: f64) -> PowerReport {
        PowerReport::new(1000, "virtualwatts", target, power)
    }

    #[test]
    fn test_json_pusher_writes_one_line_per_report() {
        let mut pusher = JsonPusher::new("json", Vec::new());
        pusher.push(&report("t1", 70.0)).unwrap();
        pusher.push(&report("t2", 30.0)).unwrap();
        let out = String::from_utf8(pusher.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: PowerReport = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, report("t2", 30.0));
    }

    #[test]
    fn test_csv_pusher_writes_header_once() {
        let mut pusher = CsvPusher::new("csv", Vec::new());
        pusher.push(&report("t1", 70.0)).unwrap();
        pusher.push(&report("t2", 30.5)).unwrap();
        let out = String::from_utf8(pusher.into_inner()).unwrap();
        assert_eq!(
            out,
            "timestamp,sensor,target,power\n\
             1000,virtualwatts,t1,70\n\
             1000,virtualwatts,t2,30.5\n"
        );
    }

    #[test]
    fn test_csv_pusher_escapes_fields() {
        let mut pusher = CsvPusher::new("csv", Vec::new());
        pusher.push(&report("a,\"b\"", 1.0)).unwrap();
        let out = String::from_utf8(pusher.into_inner()).unwrap();
        assert!(out.contains("\"a,\"\"b\"\"\""));
    }

    #[test]
    fn test_csv_pusher_quotes_cgroup_paths() {
        let mut pusher = CsvPusher::new("csv", Vec::new());
        pusher.push(&report("/system.slice/nginx,worker", 2.0)).unwrap();
        pusher.push(&report("/user.slice/bash", 1.0)).unwrap();
        let out = String::from_utf8(pusher.into_inner()).unwrap();
        let rows: Vec<&str> = out.lines().skip(1).collect();
        assert_eq!(rows[0], "1000,virtualwatts,\"/system.slice/nginx,worker\",2");
        assert_eq!(rows[1], "1000,virtualwatts,/user.slice/bash,1");
    }

    #[test]
    fn test_csv_pusher_quotes_line_breaks() {
        let mut pusher = CsvPusher::new("csv", Vec::new());
        pusher.push(&report("python\nworker.py", 1.0)).unwrap();
        let out = String::from_utf8(pusher.into_inner()).unwrap();
        assert!(out.ends_with("\"python\nworker.py\",1\n"));
    }

    #[test]
    fn test_shared_pusher_clones_write_to_one_sink() {
        let memory = MemoryPusher::new("mem");
        let handle = memory.handle();
        let mut first = SharedPusher::new(Box::new(memory));
        let mut second = first.clone();

        first.push(&report("t1", 1.0)).unwrap();
        second.push(&report("t2", 2.0)).unwrap();
        second.flush().unwrap();

        assert_eq!(first.name(), "mem");
        let targets: Vec<String> = handle.lock().unwrap().iter().map(|r| r.target.clone()).collect();
        assert_eq!(targets, vec!["t1", "t2"]);
    }

    #[test]
    fn test_csv_pusher_empty_without_reports() {
        let pusher = CsvPusher::new("csv", Vec::new());
        assert!(pusher.into_inner().is_empty());
    }

    #[test]
    fn test_json_pusher_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let mut pusher = JsonPusher::create("file", &path).unwrap();
        pusher.push(&report("t1", 1.0)).unwrap();
        pusher.flush().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"target\":\"t1\""));
    }

    #[test]
    fn test_memory_pusher_shares_reports() {
        let mut pusher = MemoryPusher::new("mem");
        let handle = pusher.handle();
        pusher.push(&report("t1", 1.0)).unwrap();
        assert_eq!(pusher.name(), "mem");
        assert_eq!(handle.lock().unwrap()[0].target, "t1");
    }
}
