//! Sample-rate monitor.
//!
//! Counts front-end samples per measurement window. A window that closes
//! while a sweep is active is booked entirely as overhead, any other window
//! entirely as throughput.

use super::{collect_errors, join_task, shutdown_channel, ShutdownListener, ShutdownTrigger};
use crate::data::storage::{timestamp, CsvLog};
use crate::error::{IaError, IaResult};
use crate::messages::Trigger;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info_span, Instrument, Span};

/// Rate monitor parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct RateMonitorConfig {
    /// Length of one counting window.
    pub meas_period: Duration,
    /// Log of every closed window.
    pub rate_log: PathBuf,
}

/// Rates of the last closed window, in samples per second.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RateReport {
    /// Samples per second outside a sweep.
    pub throughput: f64,
    /// Samples per second spent sweeping.
    pub overhead: f64,
}

impl RateReport {
    /// Books `count` samples over `period` as overhead or throughput.
    pub fn classify(count: u64, period: Duration, triggered: bool) -> Self {
        let rate = count as f64 / period.as_secs_f64();
        if triggered {
            Self {
                throughput: 0.0,
                overhead: rate,
            }
        } else {
            Self {
                throughput: rate,
                overhead: 0.0,
            }
        }
    }
}

#[derive(Debug, Default)]
struct RateWindow {
    count: u64,
    triggered: bool,
}

/// Front-end handle for counting samples.
#[derive(Clone)]
pub struct SampleCounter(Arc<Mutex<RateWindow>>);

impl SampleCounter {
    /// Adds `samples` to the open window.
    pub fn add(&self, samples: usize) {
        self.0.lock().count += samples as u64;
    }
}

/// Rate monitor component.
pub struct RateMonitor {
    meas_period: Duration,
    window: Arc<Mutex<RateWindow>>,
    inbox_tx: mpsc::UnboundedSender<Trigger>,
    inbox_rx: Option<mpsc::UnboundedReceiver<Trigger>>,
    log: Option<CsvLog>,
    report_tx: Option<watch::Sender<RateReport>>,
    report_rx: watch::Receiver<RateReport>,
    shutdown: Option<ShutdownTrigger>,
    tasks: Vec<JoinHandle<IaResult<()>>>,
    span: Span,
}

impl RateMonitor {
    /// Validates the period and creates the log.
    pub fn new(config: RateMonitorConfig) -> IaResult<Self> {
        if config.meas_period.is_zero() {
            return Err(IaError::InvalidConfig(
                "rate measurement period must be non-zero".into(),
            ));
        }
        let log = CsvLog::create(&config.rate_log, &["timestamp", "throughput", "overhead"])?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = watch::channel(RateReport::default());
        Ok(Self {
            meas_period: config.meas_period,
            window: Arc::new(Mutex::new(RateWindow::default())),
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            log: Some(log),
            report_tx: Some(report_tx),
            report_rx,
            shutdown: None,
            tasks: Vec::new(),
            span: info_span!("rate_monitor", component = "rate_measure"),
        })
    }

    /// Inbox for `trigger`.
    pub fn input(&self) -> mpsc::UnboundedSender<Trigger> {
        self.inbox_tx.clone()
    }

    /// Handle the front end counts samples into.
    pub fn counter(&self) -> SampleCounter {
        SampleCounter(Arc::clone(&self.window))
    }

    /// Rates of the most recent window.
    pub fn report(&self) -> watch::Receiver<RateReport> {
        self.report_rx.clone()
    }

    /// Spawns the trigger task and the window ticker.
    pub fn start(&mut self) -> IaResult<()> {
        let (Some(inbox), Some(log), Some(report)) =
            (self.inbox_rx.take(), self.log.take(), self.report_tx.take())
        else {
            return Err(IaError::Validation("rate monitor already started".into()));
        };
        let (trigger, listener) = shutdown_channel();
        let handler = track_trigger(Arc::clone(&self.window), inbox, listener.clone());
        let ticker = measure(
            Arc::clone(&self.window),
            self.meas_period,
            log,
            report,
            listener,
        );
        self.tasks
            .push(tokio::spawn(handler.instrument(self.span.clone())));
        self.tasks
            .push(tokio::spawn(ticker.instrument(self.span.clone())));
        self.shutdown = Some(trigger);
        Ok(())
    }

    /// Stops both tasks; the log is flushed on exit.
    pub async fn stop(&mut self) -> IaResult<()> {
        if let Some(trigger) = self.shutdown.take() {
            trigger.fire();
        }
        let mut results = Vec::new();
        for task in self.tasks.drain(..) {
            results.push(join_task(Some(task)).await);
        }
        collect_errors(results)
    }
}

async fn track_trigger(
    window: Arc<Mutex<RateWindow>>,
    mut inbox: mpsc::UnboundedReceiver<Trigger>,
    mut shutdown: ShutdownListener,
) -> IaResult<()> {
    loop {
        tokio::select! {
            biased;
            msg = inbox.recv() => match msg {
                Some(t) => window.lock().triggered = t.is_start(),
                None => break,
            },
            _ = shutdown.requested() => break,
        }
    }
    Ok(())
}

async fn measure(
    window: Arc<Mutex<RateWindow>>,
    period: Duration,
    mut log: CsvLog,
    report: watch::Sender<RateReport>,
    mut shutdown: ShutdownListener,
) -> IaResult<()> {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (count, triggered) = {
                    let mut w = window.lock();
                    (std::mem::take(&mut w.count), w.triggered)
                };
                let rates = RateReport::classify(count, period, triggered);
                debug!(
                    "throughput {:.0} S/s, overhead {:.0} S/s",
                    rates.throughput, rates.overhead
                );
                log.append([
                    timestamp(),
                    rates.throughput.to_string(),
                    rates.overhead.to_string(),
                ])?;
                report.send_replace(rates);
            }
            _ = shutdown.requested() => break,
        }
    }
    log.close()
}
