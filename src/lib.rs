//! VirtualWatts - per-process power attribution
//!
//! This library pairs machine-level power reports with per-process CPU usage
//! reports sampled at about the same time, and splits the measured power
//! across the processes in proportion to their usage.
//!
//! Pullers decode reports from sockets or files. The
//! [`dispatcher::Dispatcher`] routes them to one
//! [`formula::VirtualWattsFormula`] per power sensor, which synchronizes and
//! attributes them. Pushers write the resulting per-process reports.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod formula;
pub mod puller;
pub mod pusher;
pub mod report;
pub mod runtime;
