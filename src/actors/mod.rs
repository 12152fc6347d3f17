//! Initial-access components.
//!
//! Each component runs one inbox task that handles its inbound messages one at
//! a time, plus (for the timed components) one timing-loop task. Every wait in
//! a timing loop goes through [`ShutdownListener`], so `stop()` wakes a sleeping
//! loop immediately instead of after its dwell or cooldown.

pub mod kpi_agg;
pub mod manual_beam;
pub mod rate_monitor;
pub mod selector;
pub mod sweep;

pub use kpi_agg::{KpiAggregator, KpiAggregatorConfig, KpiInput, PowerSink};
pub use manual_beam::ManualBeam;
pub use rate_monitor::{RateMonitor, RateMonitorConfig, RateReport, SampleCounter};
pub use selector::{BeamSelector, BeamSelectorConfig, SelectorInput, SweepBuffer};
pub use sweep::{SweepConfig, SweepController, SweepPhase, SweepStatus};

use crate::error::{IaError, IaResult};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Creates a linked shutdown trigger and listener.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownListener) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownListener(rx))
}

/// Requests shutdown of every listener cloned from the same channel.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    /// Wakes every listener.
    pub fn fire(&self) {
        self.0.send_replace(true);
    }
}

/// Cancellation side of a component's shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownListener(watch::Receiver<bool>);

impl ShutdownListener {
    /// True once shutdown has been fired.
    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been requested (or the trigger is gone).
    pub async fn requested(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleeps for `duration`; returns `false` if shutdown cut the wait short.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.requested() => false,
        }
    }
}

/// Awaits a component task, flattening join and task errors.
pub(crate) async fn join_task(task: Option<JoinHandle<IaResult<()>>>) -> IaResult<()> {
    match task {
        Some(handle) => handle.await?,
        None => Ok(()),
    }
}

/// Collects the errors from several stop results into one.
pub(crate) fn collect_errors(results: Vec<IaResult<()>>) -> IaResult<()> {
    let errors: Vec<IaError> = results.into_iter().filter_map(Result::err).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(IaError::ShutdownFailed(errors))
    }
}
