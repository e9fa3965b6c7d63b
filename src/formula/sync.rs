//! Time synchronization of two independent report streams
//!
//! Power reports and usage reports come from different collectors on
//! different schedules. [`StreamSync`] buffers each stream and hands out the
//! closest (primary, secondary) pair whose timestamps lie within the delay
//! threshold. Samples that fall behind the newest timestamp seen by more
//! than the threshold are evicted and never matched.
//!
//! Per-sample lifecycle: `Buffered -> Matched | Evicted`.

use super::error::{FormulaError, Result};
use crate::report::{Report, ReportKind};
use std::collections::VecDeque;
use std::time::Duration;

/// Which of the two synchronized streams a report belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTag {
    /// Stream A: aggregate power
    Primary,
    /// Stream B: usage ratios
    Secondary,
}

/// Maps report kinds onto the two streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classifier {
    pub primary: ReportKind,
    pub secondary: ReportKind,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            primary: ReportKind::Power,
            secondary: ReportKind::Procfs,
        }
    }
}

impl Classifier {
    pub fn new(primary: ReportKind, secondary: ReportKind) -> Self {
        Self { primary, secondary }
    }

    /// Tag a report with its stream
    ///
    /// Fails when the report kind matches neither or both streams.
    pub fn classify(&self, report: &Report) -> Result<StreamTag> {
        let kind = report.kind();
        match (kind == self.primary, kind == self.secondary) {
            (true, false) => Ok(StreamTag::Primary),
            (false, true) => Ok(StreamTag::Secondary),
            (true, true) => Err(FormulaError::Classification {
                kind,
                reason: "matches both the primary and the secondary stream".to_string(),
            }),
            (false, false) => Err(FormulaError::Classification {
                kind,
                reason: format!(
                    "matches neither {} nor {}",
                    self.primary, self.secondary
                ),
            }),
        }
    }
}

/// Two reports from opposite streams, close enough in time to be paired
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedPair {
    pub primary: Report,
    pub secondary: Report,
}

/// Buffer and match counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub buffered_primary: usize,
    pub buffered_secondary: usize,
    pub matched: u64,
    pub evicted: u64,
}

/// Pairs reports of two streams within a bounded time window
#[derive(Debug)]
pub struct StreamSync {
    classifier: Classifier,
    delay_threshold: Duration,
    primary: VecDeque<Report>,
    secondary: VecDeque<Report>,
    /// Largest timestamp added so far (reports may arrive out of order)
    newest: Option<u64>,
    matched: u64,
    evicted: u64,
}

impl StreamSync {
    pub fn new(classifier: Classifier, delay_threshold: Duration) -> Self {
        Self {
            classifier,
            delay_threshold,
            primary: VecDeque::new(),
            secondary: VecDeque::new(),
            newest: None,
            matched: 0,
            evicted: 0,
        }
    }

    pub fn delay_threshold(&self) -> Duration {
        self.delay_threshold
    }

    pub fn classify(&self, report: &Report) -> Result<StreamTag> {
        self.classifier.classify(report)
    }

    /// Classify a report and append it to its stream's buffer
    pub fn add(&mut self, report: Report) -> Result<StreamTag> {
        let tag = self.classifier.classify(&report)?;
        let ts = report.timestamp();
        self.newest = Some(self.newest.map_or(ts, |n| n.max(ts)));
        match tag {
            StreamTag::Primary => self.primary.push_back(report),
            StreamTag::Secondary => self.secondary.push_back(report),
        }
        Ok(tag)
    }

    /// Extract the best pair within the window, if any
    ///
    /// Stale samples are evicted first. Among the remaining candidates the
    /// pair with the smallest timestamp gap wins; ties go to the earliest
    /// pair, then to arrival order.
    pub fn try_match(&mut self) -> Option<SyncedPair> {
        self.evict_stale();

        let mut best: Option<((u64, u64, u64), usize, usize)> = None;
        for (i, a) in self.primary.iter().enumerate() {
            let ta = a.timestamp();
            for (j, b) in self.secondary.iter().enumerate() {
                let tb = b.timestamp();
                let gap = ta.abs_diff(tb);
                if !self.within_window(gap) {
                    continue;
                }
                let key = (gap, ta.min(tb), ta);
                if best.as_ref().map_or(true, |(k, _, _)| key < *k) {
                    best = Some((key, i, j));
                }
            }
        }

        let (_, i, j) = best?;
        let primary = self.primary.remove(i)?;
        let secondary = self.secondary.remove(j)?;
        self.matched += 1;
        Some(SyncedPair { primary, secondary })
    }

    /// Number of buffered, unmatched samples across both streams
    pub fn pending(&self) -> usize {
        self.primary.len() + self.secondary.len()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            buffered_primary: self.primary.len(),
            buffered_secondary: self.secondary.len(),
            matched: self.matched,
            evicted: self.evicted,
        }
    }

    fn within_window(&self, gap_ms: u64) -> bool {
        Duration::from_millis(gap_ms) <= self.delay_threshold
    }

    /// Drop every sample older than `newest - delay_threshold`
    fn evict_stale(&mut self) -> usize {
        let Some(newest) = self.newest else {
            return 0;
        };
        let threshold = self.delay_threshold;
        let is_fresh = |r: &Report| Duration::from_millis(newest - r.timestamp()) <= threshold;

        let before = self.pending();
        self.primary.retain(is_fresh);
        self.secondary.retain(is_fresh);
        let dropped = before - self.pending();
        if dropped > 0 {
            tracing::debug!(dropped, newest, "evicted stale reports");
        }
        self.evicted += dropped as u64;
        dropped
    }
}
