//! CLI argument parsing for VirtualWatts

use crate::config::{Config, PullerConfig, PusherConfig};
use crate::formula::Normalizer;
use crate::report::ReportKind;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "virtualwatts")]
#[command(version)]
#[command(about = "Per-process power attribution from power and procfs report streams", long_about = None)]
pub struct Cli {
    /// JSON configuration file; command-line flags override its values
    #[arg(long = "config-file", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Maximum delay between a power report and a procfs report to pair them (ms)
    #[arg(long = "delay-threshold", value_name = "MS")]
    pub delay_threshold: Option<f64>,

    /// Time interval between two sensor measurements (ms)
    #[arg(long = "sampling-interval", value_name = "MS")]
    pub sampling_interval: Option<u64>,

    /// Normalizer used to split power across processes
    #[arg(long = "normalizer", value_enum)]
    pub normalizer: Option<Normalizer>,

    /// Read power reports from a file rewritten by the sensor
    #[arg(long = "power-file", value_name = "PATH")]
    pub power_file: Option<PathBuf>,

    /// Listen for power reports on HOST:PORT
    #[arg(long = "power-socket", value_name = "HOST:PORT")]
    pub power_socket: Option<String>,

    /// Read procfs reports from a file rewritten by the sensor
    #[arg(long = "procfs-file", value_name = "PATH")]
    pub procfs_file: Option<PathBuf>,

    /// Listen for procfs reports on HOST:PORT
    #[arg(long = "procfs-socket", value_name = "HOST:PORT")]
    pub procfs_socket: Option<String>,

    /// Write attributed reports as JSON lines to PATH
    #[arg(long = "json-output", value_name = "PATH")]
    pub json_output: Option<PathBuf>,

    /// Write attributed reports as CSV to PATH
    #[arg(long = "csv-output", value_name = "PATH")]
    pub csv_output: Option<PathBuf>,

    /// Keep polling inputs instead of reading them once
    #[arg(long)]
    pub stream: bool,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    pub verbose: bool,

    /// Trace-level logging
    #[arg(long)]
    pub debug: bool,
}

fn parse_socket(addr: &str) -> Result<(String, u16)> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("invalid socket address '{}', expected HOST:PORT", addr);
    };
    let port = port
        .parse()
        .with_context(|| format!("invalid port in '{}'", addr))?;
    Ok((host.to_string(), port))
}

impl Cli {
    /// Merge the configuration file (if any) with command-line flags
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config_file {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.verbose |= self.verbose;
        config.stream |= self.stream;
        if let Some(delay) = self.delay_threshold {
            config.formula.delay_threshold = delay;
        }
        if let Some(interval) = self.sampling_interval {
            config.formula.sensor_reports_sampling_interval = interval;
        }
        if let Some(normalizer) = self.normalizer {
            config.formula.normalizer = normalizer;
        }

        if let Some(path) = self.power_file {
            config.input.insert(
                "power_file".to_string(),
                PullerConfig::Filedb {
                    model: ReportKind::Power,
                    filename: path,
                },
            );
        }
        if let Some(addr) = self.power_socket {
            let (uri, port) = parse_socket(&addr)?;
            config.input.insert(
                "power_socket".to_string(),
                PullerConfig::Socket {
                    model: ReportKind::Power,
                    uri,
                    port,
                },
            );
        }
        if let Some(path) = self.procfs_file {
            config.input.insert(
                "procfs_file".to_string(),
                PullerConfig::Filedb {
                    model: ReportKind::Procfs,
                    filename: path,
                },
            );
        }
        if let Some(addr) = self.procfs_socket {
            let (uri, port) = parse_socket(&addr)?;
            config.input.insert(
                "procfs_socket".to_string(),
                PullerConfig::Socket {
                    model: ReportKind::Procfs,
                    uri,
                    port,
                },
            );
        }

        if let Some(path) = self.json_output {
            config.output.insert(
                "json_output".to_string(),
                PusherConfig::Json {
                    filename: Some(path),
                },
            );
        }
        if let Some(path) = self.csv_output {
            config
                .output
                .insert("csv_output".to_string(), PusherConfig::Csv { filename: path });
        }
        if config.output.is_empty() {
            config
                .output
                .insert("stdout".to_string(), PusherConfig::Json { filename: None });
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["virtualwatts"]);
        assert!(cli.config_file.is_none());
        assert!(!cli.stream);
        assert!(!cli.verbose);
        assert!(cli.normalizer.is_none());
    }

    #[test]
    fn test_cli_formula_flags() {
        let cli = Cli::parse_from([
            "virtualwatts",
            "--delay-threshold",
            "500",
            "--sampling-interval",
            "1000",
            "--normalizer",
            "usage-sum",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.formula.delay_threshold, 500.0);
        assert_eq!(config.formula.sensor_reports_sampling_interval, 1000);
        assert_eq!(config.formula.normalizer, Normalizer::UsageSum);
    }

    #[test]
    fn test_cli_inputs_and_default_output() {
        let cli = Cli::parse_from([
            "virtualwatts",
            "--power-file",
            "/tmp/power.json",
            "--procfs-socket",
            "127.0.0.1:9999",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.input["power_file"].model(), ReportKind::Power);
        assert_eq!(
            config.input["procfs_socket"],
            PullerConfig::Socket {
                model: ReportKind::Procfs,
                uri: "127.0.0.1".to_string(),
                port: 9999,
            }
        );
        assert_eq!(config.output["stdout"], PusherConfig::Json { filename: None });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_csv_output_replaces_stdout() {
        let cli = Cli::parse_from(["virtualwatts", "--csv-output", "/tmp/out.csv"]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.output.len(), 1);
        assert!(config.output.contains_key("csv_output"));
    }

    #[test]
    fn test_cli_bad_socket_address() {
        let cli = Cli::parse_from(["virtualwatts", "--power-socket", "localhost"]);
        assert!(cli.into_config().is_err());

        let cli = Cli::parse_from(["virtualwatts", "--power-socket", "localhost:http"]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn test_cli_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"formula": {"delay-threshold": 100}, "output": {"o": {"type": "json"}}}"#,
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::parse_from([
            "virtualwatts",
            "--config-file",
            path.as_str(),
            "--delay-threshold",
            "300",
            "-v",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.formula.delay_threshold, 300.0);
        assert!(config.verbose);
        assert_eq!(config.output.len(), 1);
    }

    #[test]
    fn test_cli_normalizer_names_match_config_file() {
        let cli = Cli::parse_from(["virtualwatts", "--normalizer", "global-usage"]);
        assert_eq!(cli.normalizer, Some(Normalizer::GlobalUsage));

        let from_file: Normalizer = serde_json::from_str("\"usage-sum\"").unwrap();
        let cli = Cli::parse_from(["virtualwatts", "--normalizer", "usage-sum"]);
        assert_eq!(cli.normalizer, Some(from_file));
    }

    #[test]
    fn test_cli_unknown_normalizer_rejected() {
        assert!(Cli::try_parse_from(["virtualwatts", "--normalizer", "median"]).is_err());
    }
}
