//! Configuration file for a VirtualWatts run
//!
//! The file is JSON with kebab-case keys:
//!
//! ```json
//! {
//!   "verbose": true,
//!   "stream": true,
//!   "input": {
//!     "puller_filedb": {"type": "filedb", "model": "PowerReport", "filename": "/tmp/power.json"},
//!     "puller_tcp": {"type": "socket", "model": "ProcfsReport", "uri": "127.0.0.1", "port": 9999}
//!   },
//!   "output": {"power_pusher": {"type": "csv", "filename": "/tmp/power.csv"}},
//!   "formula": {"delay-threshold": 500, "sensor-reports-sampling-interval": 500}
//! }
//! ```

use crate::formula::{Classifier, FormulaConfig, Normalizer};
use crate::report::ReportKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Full configuration of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub verbose: bool,
    /// Keep pullers running and polling instead of reading inputs once
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub input: BTreeMap<String, PullerConfig>,
    #[serde(default)]
    pub output: BTreeMap<String, PusherConfig>,
    #[serde(default)]
    pub formula: FormulaSection,
}

/// Input source definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PullerConfig {
    /// TCP listener receiving a stream of JSON reports
    Socket {
        model: ReportKind,
        #[serde(default = "default_uri")]
        uri: String,
        port: u16,
    },
    /// File rewritten by a sensor at each sampling tick
    Filedb { model: ReportKind, filename: PathBuf },
}

impl PullerConfig {
    pub fn model(&self) -> ReportKind {
        match self {
            PullerConfig::Socket { model, .. } | PullerConfig::Filedb { model, .. } => *model,
        }
    }
}

/// Output sink definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PusherConfig {
    /// JSON lines, to `filename` or stdout
    Json {
        #[serde(default)]
        filename: Option<PathBuf>,
    },
    Csv { filename: PathBuf },
}

/// Formula parameters as written in the file (milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FormulaSection {
    #[serde(default = "default_delay_threshold")]
    pub delay_threshold: f64,
    #[serde(default = "default_sampling_interval")]
    pub sensor_reports_sampling_interval: u64,
    #[serde(default)]
    pub normalizer: Normalizer,
}

impl Default for FormulaSection {
    fn default() -> Self {
        Self {
            delay_threshold: default_delay_threshold(),
            sensor_reports_sampling_interval: default_sampling_interval(),
            normalizer: Normalizer::default(),
        }
    }
}

fn default_uri() -> String {
    "127.0.0.1".to_string()
}

fn default_delay_threshold() -> f64 {
    250.0
}

fn default_sampling_interval() -> u64 {
    500
}

impl Config {
    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.is_empty() {
            return Err(ConfigError::Invalid("no input configured".to_string()));
        }

        if self.output.is_empty() {
            return Err(ConfigError::Invalid("no output configured".to_string()));
        }

        let delay = self.formula.delay_threshold;
        if !delay.is_finite() || delay < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "delay-threshold must be a non-negative number of milliseconds, got {}",
                delay
            )));
        }

        self.formula_config()
            .validate()
            .map_err(ConfigError::Invalid)
    }

    /// Formula parameters with durations resolved
    pub fn formula_config(&self) -> FormulaConfig {
        FormulaConfig {
            delay_threshold: Duration::from_micros(
                (self.formula.delay_threshold.max(0.0) * 1000.0).round() as u64,
            ),
            sampling_interval: Duration::from_millis(self.formula.sensor_reports_sampling_interval),
            normalizer: self.formula.normalizer,
            classifier: Classifier::default(),
        }
    }
}
