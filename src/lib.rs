//! Core library for millimeter-wave initial access.
//!
//! Initial access (IA) finds the TX/RX beam pair with the strongest link by
//! sweeping a grid of candidate pairs, scoring each from received power and
//! steering the radio heads to the winner, then repeating as the channel
//! changes.
//!
//! The crate is organised as a set of independently clocked components that
//! only talk through typed messages:
//!
//! - [`actors::SweepController`] walks the TX x RX cross-product on a timer
//! - [`actors::KpiAggregator`] turns the power stream into per-pair KPIs
//! - [`actors::RateMonitor`] books sample rates as throughput or overhead
//! - [`actors::BeamSelector`] picks the pair with the highest median KPI
//! - [`hardware::BeamMapper`] encodes beam changes as GPIO register writes
//!
//! [`app::InitialAccess`] wires them together; [`hardware::MockFrontEnd`]
//! stands in for the radio.

pub mod actors;
pub mod app;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod hardware;
pub mod messages;

pub use error::{IaError, IaResult};
