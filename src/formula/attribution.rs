// Power attribution for one synchronized (power, usage) pair
//
// Splits the aggregate power of a PowerReport across the processes of the
// paired ProcfsReport, proportionally to their CPU usage ratios.
//
// Normalizer policy: the default divides by the host-wide
// `global_cpu_usage` reported alongside the ratios. Shares then sum to
// `power * sum(ratios) / global_cpu_usage`, which is only equal to the
// aggregate power when the ratios add up to the global figure. The
// `UsageSum` policy divides by the sum of the ratios instead and always
// conserves power.

use super::error::{FormulaError, Result};
use super::sync::SyncedPair;
use crate::report::{PowerReport, ProcfsReport, Report, FORMULA_SENSOR};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Denominator used to turn usage ratios into power shares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Normalizer {
    /// Divide by `ProcfsReport::global_cpu_usage`
    #[default]
    GlobalUsage,
    /// Divide by the sum of all per-process ratios (power-conserving)
    UsageSum,
}

impl fmt::Display for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Normalizer::GlobalUsage => write!(f, "global-usage"),
            Normalizer::UsageSum => write!(f, "usage-sum"),
        }
    }
}

impl Normalizer {
    /// Resolve the denominator for one usage report
    fn resolve(self, usage: &ProcfsReport) -> Result<f64> {
        let value = match self {
            Normalizer::GlobalUsage => usage.global_cpu_usage.ok_or_else(|| {
                FormulaError::Attribution(format!(
                    "usage report from {} at {} has no global_cpu_usage",
                    usage.sensor, usage.timestamp
                ))
            })?,
            Normalizer::UsageSum => usage.usage.values().sum(),
        };

        if !value.is_finite() || value == 0.0 {
            return Err(FormulaError::Attribution(format!(
                "{} normalizer is {} for usage report at {}",
                self, value, usage.timestamp
            )));
        }
        Ok(value)
    }
}

/// A power report and a usage report synchronized in time
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    pub power: PowerReport,
    pub usage: ProcfsReport,
}

impl MatchedPair {
    pub fn new(power: PowerReport, usage: ProcfsReport) -> Self {
        Self { power, usage }
    }

    /// Unpack a synchronized pair, whichever stream carries the power reports
    pub fn from_synced(pair: SyncedPair) -> Result<Self> {
        match (pair.primary, pair.secondary) {
            (Report::Power(power), Report::Procfs(usage))
            | (Report::Procfs(usage), Report::Power(power)) => Ok(Self { power, usage }),
            (a, _) => Err(FormulaError::Classification {
                kind: a.kind(),
                reason: "paired with a report of the same kind".to_string(),
            }),
        }
    }
}

/// Compute one power report per process of the pair's usage report
///
/// An empty usage map yields no reports and never fails, whatever the
/// normalizer.
///
/// # Example
/// ```
/// use std::collections::BTreeMap;
/// use virtualwatts::formula::{attribute, MatchedPair, Normalizer};
/// use virtualwatts::report::{PowerReport, ProcfsReport};
///
/// let usage = BTreeMap::from([("t1".to_string(), 0.7), ("t2".to_string(), 0.3)]);
/// let pair = MatchedPair::new(
///     PowerReport::new(0, "rapl", "all", 100.0),
///     ProcfsReport::new(0, "procfs", "all", usage, Some(2.0)),
/// );
///
/// let reports = attribute(&pair, Normalizer::GlobalUsage).unwrap();
/// assert_eq!(reports[0].target, "t1");
/// assert!((reports[0].power - 35.0).abs() < 1e-9);
/// ```
pub fn attribute(pair: &MatchedPair, normalizer: Normalizer) -> Result<Vec<PowerReport>> {
    if pair.usage.usage.is_empty() {
        return Ok(Vec::new());
    }

    let denominator = normalizer.resolve(&pair.usage)?;

    let reports = pair
        .usage
        .usage
        .iter()
        .map(|(process, ratio)| PowerReport {
            timestamp: pair.power.timestamp,
            sensor: FORMULA_SENSOR.to_string(),
            target: process.clone(),
            power: pair.power.power * ratio / denominator,
            metadata: BTreeMap::new(),
        })
        .collect();

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(power: f64, usage: &[(&str, f64)], global: Option<f64>) -> MatchedPair {
        let usage = usage.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        MatchedPair::new(
            PowerReport::new(1000, "rapl", "all", power),
            ProcfsReport::new(1000, "procfs", "all", usage, global),
        )
    }

    #[test]
    fn test_single_process_takes_all_power() {
        let reports = attribute(&pair(42.0, &[("t1", 0.5)], Some(0.5)), Normalizer::GlobalUsage)
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].target, "t1");
        assert_eq!(reports[0].sensor, FORMULA_SENSOR);
        assert_eq!(reports[0].timestamp, 1000);
        assert!((reports[0].power - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_usage_sum_conserves_power() {
        let p = pair(90.0, &[("a", 0.2), ("b", 0.1), ("c", 0.3)], Some(3.0));
        let reports = attribute(&p, Normalizer::UsageSum).unwrap();
        let total: f64 = reports.iter().map(|r| r.power).sum();
        assert!((total - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_global_usage_fails() {
        let err = attribute(&pair(10.0, &[("a", 0.5)], Some(0.0)), Normalizer::GlobalUsage)
            .unwrap_err();
        assert!(matches!(err, FormulaError::Attribution(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_missing_global_usage_fails() {
        let err =
            attribute(&pair(10.0, &[("a", 0.5)], None), Normalizer::GlobalUsage).unwrap_err();
        assert!(err.to_string().contains("global_cpu_usage"));
    }

    #[test]
    fn test_non_finite_normalizer_fails() {
        assert!(attribute(&pair(10.0, &[("a", 0.5)], Some(f64::NAN)), Normalizer::GlobalUsage)
            .is_err());
        assert!(attribute(
            &pair(10.0, &[("a", f64::INFINITY)], None),
            Normalizer::UsageSum
        )
        .is_err());
    }

    #[test]
    fn test_zero_usage_sum_fails() {
        let err = attribute(&pair(10.0, &[("a", 0.0), ("b", 0.0)], None), Normalizer::UsageSum)
            .unwrap_err();
        assert!(matches!(err, FormulaError::Attribution(_)));
    }

    #[test]
    fn test_empty_usage_yields_nothing() {
        for normalizer in [Normalizer::GlobalUsage, Normalizer::UsageSum] {
            let reports = attribute(&pair(10.0, &[], None), normalizer).unwrap();
            assert!(reports.is_empty());
        }
    }

    #[test]
    fn test_from_synced_accepts_either_order() {
        let power: Report = PowerReport::new(1, "rapl", "all", 5.0).into();
        let usage: Report =
            ProcfsReport::new(1, "procfs", "all", BTreeMap::new(), Some(1.0)).into();

        let forward = MatchedPair::from_synced(SyncedPair {
            primary: power.clone(),
            secondary: usage.clone(),
        })
        .unwrap();
        let reverse = MatchedPair::from_synced(SyncedPair {
            primary: usage,
            secondary: power,
        })
        .unwrap();
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_from_synced_rejects_same_kind() {
        let power: Report = PowerReport::new(1, "rapl", "all", 5.0).into();
        let err = MatchedPair::from_synced(SyncedPair {
            primary: power.clone(),
            secondary: power,
        })
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_normalizer_serde_names() {
        let n: Normalizer = serde_json::from_str("\"usage-sum\"").unwrap();
        assert_eq!(n, Normalizer::UsageSum);
        assert_eq!(Normalizer::default(), Normalizer::GlobalUsage);
        assert_eq!(Normalizer::GlobalUsage.to_string(), "global-usage");
    }
}
