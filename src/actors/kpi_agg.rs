//! KPI aggregator.
//!
//! Two paths share one mutex-guarded state:
//!
//! - the ingest path: power batches from the front end ([`PowerSink`]) and
//!   `trigger` / `beam_id` messages from the inbox;
//! - the measurement ticker: every `meas_period` it turns the latest accepted
//!   level into a `kpi` message for the active pair.
//!
//! A tick that follows a beam change is skipped so power measured during the
//! transition is never attributed to the new pair.

use super::{collect_errors, join_task, shutdown_channel, ShutdownListener, ShutdownTrigger};
use crate::core::{BeamIndex, BeamPair, KpiSample};
use crate::data::storage::{timestamp, CsvLog};
use crate::error::{IaError, IaResult};
use crate::messages::{BeamId, Kpi, Outlet, Trigger};
use chrono::Local;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, Instrument, Span};

/// KPI aggregator parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct KpiAggregatorConfig {
    /// Time between KPI readings.
    pub meas_period: Duration,
    /// Squelch floor in dB.
    pub sensitivity: f64,
    /// Measure without waiting for a trigger.
    pub standalone: bool,
    /// Log of every beam change.
    pub beam_log: PathBuf,
    /// Log of every published KPI.
    pub measurement_log: PathBuf,
}

/// Inbound messages of the aggregator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KpiInput {
    /// Sweep start/stop.
    Trigger(Trigger),
    /// Beam change, possibly single-sided.
    BeamId(BeamId),
}

impl From<Trigger> for KpiInput {
    fn from(t: Trigger) -> Self {
        KpiInput::Trigger(t)
    }
}

impl From<BeamId> for KpiInput {
    fn from(b: BeamId) -> Self {
        KpiInput::BeamId(b)
    }
}

#[derive(Debug)]
struct KpiState {
    tx: Option<BeamIndex>,
    rx: Option<BeamIndex>,
    latest: Option<f64>,
    just_changed: bool,
    triggered: bool,
}

impl KpiState {
    fn new(standalone: bool) -> Self {
        Self {
            tx: None,
            rx: None,
            latest: None,
            just_changed: false,
            triggered: standalone,
        }
    }

    fn pair(&self) -> Option<BeamPair> {
        Some(BeamPair::new(self.tx?, self.rx?))
    }

    fn apply_beam(&mut self, beam: BeamId) {
        if let Some(tx) = beam.tx() {
            self.tx = Some(tx);
        }
        if let Some(rx) = beam.rx() {
            self.rx = Some(rx);
        }
        self.latest = None;
        self.just_changed = true;
    }

    fn accept(&mut self, level: f64, sensitivity: f64) -> bool {
        if !self.triggered || self.pair().is_none() || level <= sensitivity {
            return false;
        }
        self.latest = Some(level);
        true
    }

    /// Reading for this tick, if one is due.
    fn take_reading(&mut self) -> Option<KpiSample> {
        if self.just_changed {
            self.just_changed = false;
            return None;
        }
        if !self.triggered {
            return None;
        }
        Some(KpiSample {
            pair: self.pair()?,
            value: self.latest?,
            timestamp: Local::now(),
        })
    }
}

/// Front-end handle for power batches (dB).
#[derive(Clone)]
pub struct PowerSink {
    state: Arc<Mutex<KpiState>>,
    sensitivity: f64,
}

impl PowerSink {
    /// Reduces `batch` to its mean and stores it if it clears the squelch.
    /// Returns whether the level was accepted.
    pub fn push(&self, batch: &[f32]) -> bool {
        if batch.is_empty() {
            return false;
        }
        let mean = batch.iter().map(|&v| f64::from(v)).sum::<f64>() / batch.len() as f64;
        self.state.lock().accept(mean, self.sensitivity)
    }
}

/// KPI aggregator component.
pub struct KpiAggregator {
    config: KpiAggregatorConfig,
    state: Arc<Mutex<KpiState>>,
    inbox_tx: mpsc::UnboundedSender<KpiInput>,
    inbox_rx: Option<mpsc::UnboundedReceiver<KpiInput>>,
    logs: Option<(CsvLog, CsvLog)>,
    kpi_out: Outlet<Kpi>,
    shutdown: Option<ShutdownTrigger>,
    tasks: Vec<JoinHandle<IaResult<()>>>,
    span: Span,
}

impl KpiAggregator {
    /// Validates the period and creates both logs.
    pub fn new(config: KpiAggregatorConfig) -> IaResult<Self> {
        if config.meas_period.is_zero() {
            return Err(IaError::InvalidConfig(
                "KPI measurement period must be non-zero".into(),
            ));
        }
        let beam_log = CsvLog::create(&config.beam_log, &["timestamp", "tx", "rx"])?;
        let measurement_log =
            CsvLog::create(&config.measurement_log, &["timestamp", "tx", "rx", "kpi"])?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Ok(Self {
            state: Arc::new(Mutex::new(KpiState::new(config.standalone))),
            config,
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            logs: Some((beam_log, measurement_log)),
            kpi_out: Outlet::new("kpi"),
            shutdown: None,
            tasks: Vec::new(),
            span: info_span!("kpi_aggregator", component = "kpi_agg"),
        })
    }

    /// Inbox for `trigger` and `beam_id`.
    pub fn input(&self) -> mpsc::UnboundedSender<KpiInput> {
        self.inbox_tx.clone()
    }

    /// Handle the front end pushes power batches into.
    pub fn power_sink(&self) -> PowerSink {
        PowerSink {
            state: Arc::clone(&self.state),
            sensitivity: self.config.sensitivity,
        }
    }

    /// `kpi` output; connect before `start()`.
    pub fn kpi_outlet(&mut self) -> &mut Outlet<Kpi> {
        &mut self.kpi_out
    }

    /// Spawns the inbox task and the measurement ticker.
    pub fn start(&mut self) -> IaResult<()> {
        let (Some(inbox), Some((beam_log, measurement_log))) =
            (self.inbox_rx.take(), self.logs.take())
        else {
            return Err(IaError::Validation("KPI aggregator already started".into()));
        };
        let (trigger, listener) = shutdown_channel();

        let handler = handle_inbox(
            Arc::clone(&self.state),
            inbox,
            beam_log,
            listener.clone(),
        );
        let ticker = measure(
            Arc::clone(&self.state),
            self.config.meas_period,
            std::mem::replace(&mut self.kpi_out, Outlet::new("kpi")),
            measurement_log,
            listener,
        );
        self.tasks
            .push(tokio::spawn(handler.instrument(self.span.clone())));
        self.tasks
            .push(tokio::spawn(ticker.instrument(self.span.clone())));
        self.shutdown = Some(trigger);
        Ok(())
    }

    /// Stops both tasks; their logs are flushed on exit.
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

async fn handle_inbox(
    state: Arc<Mutex<KpiState>>,
    mut inbox: mpsc::UnboundedReceiver<KpiInput>,
    mut beam_log: CsvLog,
    mut shutdown: ShutdownListener,
) -> IaResult<()> {
    loop {
        tokio::select! {
            biased;
            msg = inbox.recv() => match msg {
                Some(KpiInput::Trigger(t)) => {
                    state.lock().triggered = t.is_start();
                    info!("Measurement {}", if t.is_start() { "started" } else { "stopped" });
                }
                Some(KpiInput::BeamId(beam)) => {
                    let (tx, rx) = {
                        let mut s = state.lock();
                        s.apply_beam(beam);
                        (s.tx, s.rx)
                    };
                    let show = |b: Option<BeamIndex>| b.map(|i| i.to_string()).unwrap_or_default();
                    beam_log.append([timestamp(), show(tx), show(rx)])?;
                }
                None => break,
            },
            _ = shutdown.requested() => break,
        }
    }
    beam_log.close()
}

async fn measure(
    state: Arc<Mutex<KpiState>>,
    period: Duration,
    mut out: Outlet<Kpi>,
    mut log: CsvLog,
    mut shutdown: ShutdownListener,
) -> IaResult<()> {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reading = state.lock().take_reading();
                let Some(sample) = reading else {
                    continue;
                };
                debug!("KPI {:.2} dB on {}", sample.value, sample.pair);
                out.publish(Kpi::new(sample.pair, sample.value));
                log.append([
                    sample.timestamp.format("%H:%M:%S%.6f").to_string(),
                    sample.pair.tx.to_string(),
                    sample.pair.rx.to_string(),
                    sample.value.to_string(),
                ])?;
            }
            _ = shutdown.requested() => break,
        }
    }
    log.close()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(tx: i64, rx: i64) -> BeamPair {
        BeamPair::from_raw(tx, rx).unwrap()
    }

    #[test]
    fn test_tick_after_beam_change_is_skipped() {
        let mut state = KpiState::new(true);
        state.apply_beam(BeamId::pair(pair(3, 4)));
        assert!(state.accept(-40.0, -90.0));
        assert!(state.take_reading().is_none());
        let reading = state.take_reading().unwrap();
        assert_eq!(reading.pair, pair(3, 4));
        assert_eq!(reading.value, -40.0);
    }

    #[test]
    fn test_squelch_and_trigger_gate() {
        let mut state = KpiState::new(false);
        state.apply_beam(BeamId::pair(pair(1, 1)));
        assert!(!state.accept(-40.0, -90.0), "not triggered");
        state.triggered = true;
        assert!(!state.accept(-95.0, -90.0), "below the floor");
        assert!(state.accept(-89.0, -90.0));
    }

    #[test]
    fn test_partial_beam_ids_merge() {
        let mut state = KpiState::new(true);
        state.apply_beam(BeamId::tx_only(BeamIndex::new(7).unwrap()));
        assert!(!state.accept(-10.0, -90.0), "no rx yet");
        state.apply_beam(BeamId::rx_only(BeamIndex::new(9).unwrap()));
        assert_eq!(state.pair(), Some(pair(7, 9)));
    }

    #[test]
    fn test_beam_change_discards_old_level() {
        let mut state = KpiState::new(true);
        state.apply_beam(BeamId::pair(pair(1, 1)));
        state.accept(-30.0, -90.0);
        state.take_reading();
        state.apply_beam(BeamId::pair(pair(1, 2)));
        state.take_reading();
        assert!(state.take_reading().is_none());
    }

    fn config(dir: &tempfile::TempDir, standalone: bool) -> KpiAggregatorConfig {
        KpiAggregatorConfig {
            meas_period: Duration::from_millis(100),
            sensitivity: -90.0,
            standalone,
            beam_log: dir.path().join("kpi_beam.csv"),
            measurement_log: dir.path().join("kpi_meas.csv"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_after_settling_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = KpiAggregator::new(config(&dir, true)).unwrap();
        let mut kpis = agg.kpi_outlet().subscribe();
        let sink = agg.power_sink();
        let input = agg.input();
        let t0 = Instant::now();
        agg.start().unwrap();

        input.send(BeamId::pair(pair(3, 4)).into()).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(sink.push(&[-41.0, -39.0]));

        let kpi = kpis.recv().await.unwrap();
        assert_eq!(kpi.pair(), pair(3, 4));
        assert_eq!(kpi.val, -40.0);
        // the first tick (100 ms) followed the beam change
        assert!(t0.elapsed() >= Duration::from_millis(200));
        agg.stop().await.unwrap();

        let meas = std::fs::read_to_string(dir.path().join("kpi_meas.csv")).unwrap();
        let row = meas.lines().nth(1).unwrap();
        assert!(row.ends_with(",3,4,-40"), "row was {}", row);
        let beams = std::fs::read_to_string(dir.path().join("kpi_beam.csv")).unwrap();
        assert!(beams.lines().nth(1).unwrap().ends_with(",3,4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_without_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = KpiAggregator::new(config(&dir, false)).unwrap();
        let mut kpis = agg.kpi_outlet().subscribe();
        let sink = agg.power_sink();
        let input = agg.input();
        agg.start().unwrap();

        input.send(BeamId::pair(pair(1, 1)).into()).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!sink.push(&[-20.0]));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(kpis.try_recv().is_err());

        input.send(Trigger::START.into()).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(sink.push(&[-20.0]));
        let kpi = kpis.recv().await.unwrap();
        assert_eq!(kpi.val, -20.0);
        agg.stop().await.unwrap();
    }
}
