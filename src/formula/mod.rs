// VirtualWatts formula: per-process power from synchronized report streams
//
// Message flow for one inbound report:
//   classify -> buffer -> match -> attribute -> push to every pusher
//
// The formula processes one message to completion before the next one
// (`on_message` takes `&mut self`). Hosts running it behind threads keep it
// on a single worker (see `runtime`).

mod attribution;
mod error;
mod sync;

pub use attribution::{attribute, MatchedPair, Normalizer};
pub use error::{FormulaError, Result};
pub use sync::{Classifier, StreamSync, StreamTag, SyncStats, SyncedPair};

use crate::pusher::Pusher;
use crate::report::{PowerReport, ProcfsReport, Report};
use std::time::Duration;

/// Messages a formula worker can receive
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Power(PowerReport),
    Procfs(ProcfsReport),
    /// Anything else a host may route here by mistake
    Other { kind: String },
}

impl Message {
    /// Timestamp of the carried report, if any
    pub fn timestamp(&self) -> Option<u64> {
        match self {
            Message::Power(r) => Some(r.timestamp),
            Message::Procfs(r) => Some(r.timestamp),
            Message::Other { .. } => None,
        }
    }
}

impl From<Report> for Message {
    fn from(report: Report) -> Self {
        match report {
            Report::Power(r) => Message::Power(r),
            Report::Procfs(r) => Message::Procfs(r),
        }
    }
}

/// Formula parameters
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaConfig {
    /// Maximum timestamp gap between two paired reports
    pub delay_threshold: Duration,
    /// Interval between two sensor measurements; only paces file pullers
    pub sampling_interval: Duration,
    pub normalizer: Normalizer,
    pub classifier: Classifier,
}

impl Default for FormulaConfig {
    fn default() -> Self {
        Self {
            delay_threshold: Duration::from_millis(250),
            sampling_interval: Duration::from_millis(500),
            normalizer: Normalizer::default(),
            classifier: Classifier::default(),
        }
    }
}

impl FormulaConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.sampling_interval.is_zero() {
            return Err("sampling interval must be > 0".to_string());
        }

        if self.classifier.primary == self.classifier.secondary {
            return Err(format!(
                "primary and secondary streams must differ, both are {}",
                self.classifier.primary
            ));
        }

        Ok(())
    }
}

/// Counters exposed by a running formula
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormulaStats {
    /// Reports accepted into the synchronizer
    pub received: u64,
    /// Attributed reports produced (each counted once, whatever the pusher count)
    pub emitted: u64,
    /// Matched pairs dropped because attribution failed
    pub dropped_pairs: u64,
    /// Individual push attempts that failed
    pub push_failures: u64,
    /// Messages rejected as unsupported
    pub unsupported: u64,
    pub sync: SyncStats,
}

impl FormulaStats {
    /// Add the counters of another formula (per-sensor totals)
    pub fn merge(&mut self, other: &FormulaStats) {
        self.received += other.received;
        self.emitted += other.emitted;
        self.dropped_pairs += other.dropped_pairs;
        self.push_failures += other.push_failures;
        self.unsupported += other.unsupported;
        self.sync.buffered_primary += other.sync.buffered_primary;
        self.sync.buffered_secondary += other.sync.buffered_secondary;
        self.sync.matched += other.sync.matched;
        self.sync.evicted += other.sync.evicted;
    }
}

/// Pairs power and usage reports and emits per-process power reports
pub struct VirtualWattsFormula {
    config: FormulaConfig,
    sync: StreamSync,
    pushers: Vec<Box<dyn Pusher>>,
    stats: FormulaStats,
}

impl VirtualWattsFormula {
    pub fn new(config: FormulaConfig, pushers: Vec<Box<dyn Pusher>>) -> Self {
        let sync = StreamSync::new(config.classifier, config.delay_threshold);
        Self {
            config,
            sync,
            pushers,
            stats: FormulaStats::default(),
        }
    }

    pub fn config(&self) -> &FormulaConfig {
        &self.config
    }

    pub fn pusher_names(&self) -> Vec<&str> {
        self.pushers.iter().map(|p| p.name()).collect()
    }

    /// Handle one inbound message
    ///
    /// Returns the number of attributed reports produced. Classification
    /// errors are returned as-is (see [`FormulaError::is_fatal`]); an
    /// attribution error drops the pair and returns `Ok(0)`.
    pub fn on_message(&mut self, message: Message) -> Result<usize> {
        let report = match message {
            Message::Power(r) => Report::Power(r),
            Message::Procfs(r) => Report::Procfs(r),
            Message::Other { kind } => {
                self.stats.unsupported += 1;
                return Err(FormulaError::UnsupportedMessage { kind });
            }
        };
        self.on_report(report)
    }

    /// Buffer one report and attribute the next synchronized pair
    pub fn on_report(&mut self, report: Report) -> Result<usize> {
        tracing::debug!(
            kind = %report.kind(),
            timestamp = report.timestamp(),
            sensor = report.sensor(),
            "received report"
        );
        self.sync.add(report)?;
        self.stats.received += 1;

        self.process_synced_pair()
    }

    /// Attribute and push the next synchronized pair, if one is ready
    fn process_synced_pair(&mut self) -> Result<usize> {
        let Some(synced) = self.sync.try_match() else {
            tracing::trace!(pending = self.sync.pending(), "no synced pair yet");
            return Ok(0);
        };

        let pair = MatchedPair::from_synced(synced)?;
        tracing::debug!(
            power_ts = pair.power.timestamp,
            usage_ts = pair.usage.timestamp,
            "have synced pair"
        );

        let reports = match attribute(&pair, self.config.normalizer) {
            Ok(reports) => reports,
            Err(e) => {
                tracing::warn!("Dropping pair: {}", e);
                self.stats.dropped_pairs += 1;
                return Ok(0);
            }
        };

        for report in &reports {
            self.emit(report);
        }
        self.stats.emitted += reports.len() as u64;
        Ok(reports.len())
    }

    /// Send a report to every pusher; one failing pusher does not stop the others
    fn emit(&mut self, report: &PowerReport) {
        for pusher in &mut self.pushers {
            tracing::trace!(pusher = pusher.name(), target = %report.target, "push");
            if let Err(e) = pusher.push(report) {
                tracing::warn!("Pusher {} failed: {}", pusher.name(), e);
                self.stats.push_failures += 1;
            }
        }
    }

    pub fn stats(&self) -> FormulaStats {
        FormulaStats {
            sync: self.sync.stats(),
            ..self.stats
        }
    }
}
