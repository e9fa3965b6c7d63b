//! Report types exchanged between pullers, the formula and pushers
//!
//! Two input models feed the formula: [`PowerReport`] (aggregate power of a
//! sensor) and [`ProcfsReport`] (per-process CPU usage ratios). The formula
//! emits [`PowerReport`]s again, one per process.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sensor label stamped on every attributed power report
pub const FORMULA_SENSOR: &str = "virtualwatts";

/// CSV header used for power reports
pub const CSV_HEADER_POWER: [&str; 4] = ["timestamp", "sensor", "target", "power"];

/// Errors raised while decoding reports
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Bad input data: {0}")]
    BadInputData(String),

    #[error("Unknown report model: {0}")]
    UnknownModel(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Aggregate power measured by a sensor at one sampling tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerReport {
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub sensor: String,
    pub target: String,
    /// Power in watts
    pub power: f64,
    /// Opaque key/value annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PowerReport {
    pub fn new(
        timestamp: u64,
        sensor: impl Into<String>,
        target: impl Into<String>,
        power: f64,
    ) -> Self {
        Self {
            timestamp,
            sensor: sensor.into(),
            target: target.into(),
            power,
            metadata: BTreeMap::new(),
        }
    }
}

/// Per-process CPU usage ratios sampled from procfs/cgroups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcfsReport {
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub sensor: String,
    pub target: String,
    /// Process key (pid, cgroup name) to usage ratio
    #[serde(default)]
    pub usage: BTreeMap<String, f64>,
    /// Host-wide CPU usage, reported separately from the per-process ratios
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_cpu_usage: Option<f64>,
}

impl ProcfsReport {
    pub fn new(
        timestamp: u64,
        sensor: impl Into<String>,
        target: impl Into<String>,
        usage: BTreeMap<String, f64>,
        global_cpu_usage: Option<f64>,
    ) -> Self {
        Self {
            timestamp,
            sensor: sensor.into(),
            target: target.into(),
            usage,
            global_cpu_usage,
        }
    }
}

/// Model name of a report, as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportKind {
    #[serde(rename = "PowerReport")]
    Power,
    #[serde(rename = "ProcfsReport")]
    Procfs,
}

impl ReportKind {
    /// Decode one JSON document as a report of this model
    pub fn decode(self, value: serde_json::Value) -> Result<Report, ReportError> {
        let report = match self {
            ReportKind::Power => Report::Power(serde_json::from_value(value).map_err(bad_input)?),
            ReportKind::Procfs => {
                Report::Procfs(serde_json::from_value(value).map_err(bad_input)?)
            }
        };
        Ok(report)
    }
}

fn bad_input(e: serde_json::Error) -> ReportError {
    ReportError::BadInputData(e.to_string())
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::Power => write!(f, "PowerReport"),
            ReportKind::Procfs => write!(f, "ProcfsReport"),
        }
    }
}

impl FromStr for ReportKind {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PowerReport" => Ok(ReportKind::Power),
            "ProcfsReport" => Ok(ReportKind::Procfs),
            other => Err(ReportError::UnknownModel(other.to_string())),
        }
    }
}

/// A report of either input model
///
/// The variant is the stream tag: decoders pick it from the configured
/// model, so nothing downstream inspects report contents to classify them.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Power(PowerReport),
    Procfs(ProcfsReport),
}

impl Report {
    /// Parse a JSON document as the given model
    pub fn from_json(kind: ReportKind, json: &str) -> Result<Self, ReportError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        kind.decode(value)
    }

    pub fn kind(&self) -> ReportKind {
        match self {
            Report::Power(_) => ReportKind::Power,
            Report::Procfs(_) => ReportKind::Procfs,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Report::Power(r) => r.timestamp,
            Report::Procfs(r) => r.timestamp,
        }
    }

    pub fn sensor(&self) -> &str {
        match self {
            Report::Power(r) => &r.sensor,
            Report::Procfs(r) => &r.sensor,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Report::Power(r) => &r.target,
            Report::Procfs(r) => &r.target,
        }
    }
}

impl From<PowerReport> for Report {
    fn from(report: PowerReport) -> Self {
        Report::Power(report)
    }
}

impl From<ProcfsReport> for Report {
    fn from(report: ProcfsReport) -> Self {
        Report::Procfs(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_power_report() {
        let json = r#"{"timestamp": 1000, "sensor": "rapl", "target": "all", "power": 42.5}"#;
        let report = Report::from_json(ReportKind::Power, json).unwrap();
        match report {
            Report::Power(p) => {
                assert_eq!(p.timestamp, 1000);
                assert_eq!(p.sensor, "rapl");
                assert_eq!(p.target, "all");
                assert_eq!(p.power, 42.5);
                assert!(p.metadata.is_empty());
            }
            other => panic!("expected power report, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_procfs_report() {
        let json = r#"{"timestamp": 5, "sensor": "procfs", "target": "all",
                       "usage": {"firefox": 0.25, "vim": 0.05}, "global_cpu_usage": 0.4}"#;
        let report = Report::from_json(ReportKind::Procfs, json).unwrap();
        let Report::Procfs(p) = report else {
            panic!("expected procfs report");
        };
        assert_eq!(p.usage.len(), 2);
        assert_eq!(p.usage["firefox"], 0.25);
        assert_eq!(p.global_cpu_usage, Some(0.4));
    }

    #[test]
    fn test_decode_procfs_without_global_usage() {
        let json = r#"{"timestamp": 5, "sensor": "procfs", "target": "all", "usage": {}}"#;
        let Report::Procfs(p) = Report::from_json(ReportKind::Procfs, json).unwrap() else {
            panic!("expected procfs report");
        };
        assert!(p.usage.is_empty());
        assert_eq!(p.global_cpu_usage, None);
    }

    #[test]
    fn test_missing_field_is_bad_input() {
        let json = r#"{"timestamp": 5, "sensor": "rapl", "target": "all"}"#;
        let err = Report::from_json(ReportKind::Power, json).unwrap_err();
        assert!(matches!(err, ReportError::BadInputData(_)));
        assert!(err.to_string().contains("power"));
    }

    #[test]
    fn test_invalid_json_is_json_error() {
        let err = Report::from_json(ReportKind::Power, "{not json").unwrap_err();
        assert!(matches!(err, ReportError::Json(_)));
    }

    #[test]
    fn test_report_kind_round_trips_model_names() {
        assert_eq!("PowerReport".parse::<ReportKind>().unwrap(), ReportKind::Power);
        assert_eq!("ProcfsReport".parse::<ReportKind>().unwrap(), ReportKind::Procfs);
        assert_eq!(ReportKind::Procfs.to_string(), "ProcfsReport");
        assert!("HWPCReport".parse::<ReportKind>().is_err());
    }

    #[test]
    fn test_power_report_serialization_skips_empty_metadata() {
        let report = PowerReport::new(10, FORMULA_SENSOR, "t1", 3.0);
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(
            json,
            r#"{"timestamp":10,"sensor":"virtualwatts","target":"t1","power":3.0}"#
        );
    }

    #[test]
    fn test_report_accessors() {
        let report: Report = PowerReport::new(7, "s", "t", 1.0).into();
        assert_eq!(report.kind(), ReportKind::Power);
        assert_eq!(report.timestamp(), 7);
        assert_eq!(report.sensor(), "s");
        assert_eq!(report.target(), "t");
    }
}
