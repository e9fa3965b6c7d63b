//! Routing of reports to one formula per power sensor
//!
//! A formula instance is created the first time a primary-stream report
//! (power, by default) arrives from a new sensor, and owns its synchronizer
//! exclusively. Secondary-stream reports (usage) go to the formula whose
//! sensor has the same name. When no formula carries that name, the usage
//! sensor describes the whole host and the report is handed to every
//! formula. Usage reports that arrive before any formula exists are held
//! back and replayed into the first formula created.

use crate::formula::{
    FormulaConfig, FormulaError, FormulaStats, Message, Result, StreamTag, VirtualWattsFormula,
};
use crate::pusher::{Pusher, SharedPusher};
use crate::report::Report;
use std::collections::{BTreeMap, VecDeque};

/// Usage reports kept while no formula exists yet
pub const PENDING_CAPACITY: usize = 64;

pub struct Dispatcher {
    config: FormulaConfig,
    pushers: Vec<SharedPusher>,
    formulas: BTreeMap<String, VirtualWattsFormula>,
    pending: VecDeque<Report>,
    unsupported: u64,
    unrouted: u64,
}

impl Dispatcher {
    pub fn new(config: FormulaConfig, pushers: Vec<Box<dyn Pusher>>) -> Self {
        Self {
            config,
            pushers: pushers.into_iter().map(SharedPusher::new).collect(),
            formulas: BTreeMap::new(),
            pending: VecDeque::new(),
            unsupported: 0,
            unrouted: 0,
        }
    }

    /// Sensors that currently own a formula
    pub fn sensors(&self) -> Vec<&str> {
        self.formulas.keys().map(String::as_str).collect()
    }

    pub fn formula(&self, sensor: &str) -> Option<&VirtualWattsFormula> {
        self.formulas.get(sensor)
    }

    /// Route one message; returns the number of attributed reports produced
    pub fn on_message(&mut self, message: Message) -> Result<usize> {
        let report = match message {
            Message::Power(r) => Report::Power(r),
            Message::Procfs(r) => Report::Procfs(r),
            Message::Other { kind } => {
                self.unsupported += 1;
                return Err(FormulaError::UnsupportedMessage { kind });
            }
        };

        match self.config.classifier.classify(&report)? {
            StreamTag::Primary => self.route_primary(report),
            StreamTag::Secondary => self.route_secondary(report),
        }
    }

    fn route_primary(&mut self, report: Report) -> Result<usize> {
        let sensor = report.sensor().to_string();
        if !self.formulas.contains_key(&sensor) {
            let mut formula = self.spawn_formula(&sensor);
            let mut emitted = 0;
            while let Some(held) = self.pending.pop_front() {
                emitted += formula.on_report(held)?;
            }
            emitted += formula.on_report(report)?;
            self.formulas.insert(sensor, formula);
            return Ok(emitted);
        }

        match self.formulas.get_mut(&sensor) {
            Some(formula) => formula.on_report(report),
            None => Ok(0),
        }
    }

    fn route_secondary(&mut self, report: Report) -> Result<usize> {
        if let Some(formula) = self.formulas.get_mut(report.sensor()) {
            return formula.on_report(report);
        }

        if self.formulas.is_empty() {
            if self.pending.len() == PENDING_CAPACITY {
                self.pending.pop_front();
                self.unrouted += 1;
            }
            tracing::debug!(
                sensor = report.sensor(),
                timestamp = report.timestamp(),
                "no formula yet, holding report"
            );
            self.pending.push_back(report);
            return Ok(0);
        }

        let mut emitted = 0;
        for formula in self.formulas.values_mut() {
            emitted += formula.on_report(report.clone())?;
        }
        Ok(emitted)
    }

    fn spawn_formula(&self, sensor: &str) -> VirtualWattsFormula {
        tracing::info!("Starting formula for sensor {}", sensor);
        let pushers = self
            .pushers
            .iter()
            .map(|p| Box::new(p.clone()) as Box<dyn Pusher>)
            .collect();
        VirtualWattsFormula::new(self.config.clone(), pushers)
    }

    /// Flush every configured pusher once
    pub fn flush(&mut self) {
        for pusher in &mut self.pushers {
            if let Err(e) = pusher.flush() {
                tracing::warn!("Pusher {} failed to flush: {}", pusher.name(), e);
            }
        }
    }

    /// Counters summed over every formula
    pub fn stats(&self) -> FormulaStats {
        let mut total = FormulaStats {
            unsupported: self.unsupported,
            ..FormulaStats::default()
        };
        for formula in self.formulas.values() {
            total.merge(&formula.stats());
        }
        total
    }

    /// Usage reports dropped because no formula appeared in time
    pub fn unrouted(&self) -> u64 {
        self.unrouted
    }
}
