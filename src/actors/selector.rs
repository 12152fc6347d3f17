//! Beam selector.
//!
//! Buffers KPI readings per beam pair for the duration of one sweep and picks
//! the pair with the highest median when the sweep ends. An empty sweep is a
//! defined outcome ([`SelectionOutcome::Failed`]) that falls back to
//! [`BORESIGHT`].

use super::{join_task, shutdown_channel, ShutdownListener, ShutdownTrigger};
use crate::core::{BeamPair, SelectionOutcome, BORESIGHT};
use crate::data::storage::CsvLog;
use crate::error::{IaError, IaResult};
use crate::messages::{Kpi, Outlet, Selection, Trigger};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Inbound messages of the selector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SelectorInput {
    /// Sweep start/stop.
    Trigger(Trigger),
    /// One KPI reading.
    Kpi(Kpi),
}

impl From<Trigger> for SelectorInput {
    fn from(t: Trigger) -> Self {
        SelectorInput::Trigger(t)
    }
}

impl From<Kpi> for SelectorInput {
    fn from(k: Kpi) -> Self {
        SelectorInput::Kpi(k)
    }
}

/// Beam selector parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct BeamSelectorConfig {
    /// Linear power floor on a pair's median; `0` disables it.
    pub threshold: f64,
    /// Log of every selection.
    pub selection_log: PathBuf,
    /// Log of every KPI received.
    pub kpi_log: PathBuf,
}

impl BeamSelectorConfig {
    /// Rejects a negative or non-finite threshold.
    pub fn validate(&self) -> IaResult<()> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(IaError::Validation(format!(
                "selector threshold must be >= 0, got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Decision buffer
// =============================================================================

/// KPI values of one sweep, keyed by pair in `(tx, rx)` order.
#[derive(Clone, Debug, Default)]
pub struct SweepBuffer {
    samples: BTreeMap<BeamPair, Vec<f64>>,
    threshold: f64,
}

impl SweepBuffer {
    /// Empty buffer with the given linear power floor.
    pub fn new(threshold: f64) -> Self {
        Self {
            samples: BTreeMap::new(),
            threshold,
        }
    }

    /// Drops every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Adds one reading for `pair`.
    pub fn record(&mut self, pair: BeamPair, value: f64) {
        self.samples.entry(pair).or_default().push(value);
    }

    /// Number of pairs with at least one sample.
    pub fn pair_count(&self) -> usize {
        self.samples.len()
    }

    /// Total readings across all pairs.
    pub fn sample_count(&self) -> usize {
        self.samples.values().map(Vec::len).sum()
    }

    /// Pair with the highest median. Ties go to the lowest `(tx, rx)`.
    ///
    /// KPIs are in dB; the threshold is a linear power floor, so a pair
    /// qualifies when `10^(median / 10) >= threshold`.
    pub fn decide(&self) -> SelectionOutcome {
        let mut best: Option<(BeamPair, f64)> = None;
        for (pair, values) in &self.samples {
            let Some(m) = median(values) else {
                continue;
            };
            if self.threshold > 0.0 && db_to_linear(m) < self.threshold {
                continue;
            }
            if best.map_or(true, |(_, top)| m > top) {
                best = Some((*pair, m));
            }
        }
        match best {
            Some((pair, kpi_median)) => SelectionOutcome::Winner { pair, kpi_median },
            None => SelectionOutcome::Failed,
        }
    }
}

fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 10.0)
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

// =============================================================================
// Component
// =============================================================================

/// Beam selector component.
pub struct BeamSelector {
    inbox_tx: mpsc::UnboundedSender<SelectorInput>,
    worker: Option<SelectorWorker>,
    selection_out: Outlet<Selection>,
    outcome_rx: watch::Receiver<Option<SelectionOutcome>>,
    shutdown: Option<ShutdownTrigger>,
    task: Option<JoinHandle<IaResult<()>>>,
    span: Span,
}

impl BeamSelector {
    /// Validates the threshold and opens both logs.
    pub fn new(config: BeamSelectorConfig) -> IaResult<Self> {
        config.validate()?;
        let selection_log =
            CsvLog::create(&config.selection_log, &["#", "tx", "rx", "kpi", "elapsed"])?;
        let kpi_log = CsvLog::create(&config.kpi_log, &["#", "tx", "rx", "kpi"])?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        Ok(Self {
            inbox_tx,
            worker: Some(SelectorWorker {
                inbox: inbox_rx,
                buffer: SweepBuffer::new(config.threshold),
                sweeps: 0,
                kpi_count: 0,
                active: false,
                selection_log,
                kpi_log,
                outcome: outcome_tx,
            }),
            selection_out: Outlet::new("selection"),
            outcome_rx,
            shutdown: None,
            task: None,
            span: info_span!("beam_selector", component = "beam_selector"),
        })
    }

    /// Inbox for `trigger` and `kpi`.
    pub fn input(&self) -> mpsc::UnboundedSender<SelectorInput> {
        self.inbox_tx.clone()
    }

    /// `selection` output; connect before `start()`.
    pub fn selection_outlet(&mut self) -> &mut Outlet<Selection> {
        &mut self.selection_out
    }

    /// Outcome of the most recent sweep.
    pub fn outcome(&self) -> watch::Receiver<Option<SelectionOutcome>> {
        self.outcome_rx.clone()
    }

    /// Spawns the worker.
    pub fn start(&mut self) -> IaResult<()> {
        let Some(worker) = self.worker.take() else {
            return Err(IaError::Validation("beam selector already started".into()));
        };
        let (trigger, listener) = shutdown_channel();
        let out = std::mem::replace(&mut self.selection_out, Outlet::new("selection"));
        self.shutdown = Some(trigger);
        self.task = Some(tokio::spawn(
            worker.run(out, listener).instrument(self.span.clone()),
        ));
        Ok(())
    }

    /// Stops the worker; both logs are flushed on exit.
    pub async fn stop(&mut self) -> IaResult<()> {
        if let Some(trigger) = self.shutdown.take() {
            trigger.fire();
        }
        join_task(self.task.take()).await
    }
}

struct SelectorWorker {
    inbox: mpsc::UnboundedReceiver<SelectorInput>,
    buffer: SweepBuffer,
    sweeps: u64,
    kpi_count: u64,
    active: bool,
    selection_log: CsvLog,
    kpi_log: CsvLog,
    outcome: watch::Sender<Option<SelectionOutcome>>,
}

impl SelectorWorker {
    async fn run(
        mut self,
        mut out: Outlet<Selection>,
        mut shutdown: ShutdownListener,
    ) -> IaResult<()> {
        loop {
            tokio::select! {
                biased;
                msg = self.inbox.recv() => match msg {
                    Some(SelectorInput::Trigger(t)) => self.on_trigger(t, &mut out)?,
                    Some(SelectorInput::Kpi(k)) => self.on_kpi(k)?,
                    None => break,
                },
                _ = shutdown.requested() => break,
            }
        }
        self.selection_log.close()?;
        self.kpi_log.close()?;
        Ok(())
    }

    fn on_trigger(&mut self, trigger: Trigger, out: &mut Outlet<Selection>) -> IaResult<()> {
        if trigger.is_start() {
            self.buffer.clear();
            self.sweeps += 1;
            self.active = true;
            debug!("Sweep #{} started, buffer cleared", self.sweeps);
            return Ok(());
        }
        if !self.active {
            debug!("Ignoring trigger(stop) without an active sweep");
            return Ok(());
        }
        self.active = false;

        let started = Instant::now();
        let outcome = self.buffer.decide();
        let elapsed = started.elapsed().as_secs_f64();
        let n = self.sweeps.to_string();
        match outcome {
            SelectionOutcome::Winner { pair, kpi_median } => {
                info!(
                    "Sweep #{}: selected {} with median KPI {:.2} from {} samples",
                    self.sweeps,
                    pair,
                    kpi_median,
                    self.buffer.sample_count()
                );
                self.selection_log.append([
                    n,
                    pair.tx.to_string(),
                    pair.rx.to_string(),
                    kpi_median.to_string(),
                    elapsed.to_string(),
                ])?;
            }
            SelectionOutcome::Failed => {
                warn!(
                    "Sweep #{}: no qualifying KPI samples, falling back to boresight {}",
                    self.sweeps, BORESIGHT
                );
                self.selection_log
                    .append([n, "0".into(), "0".into(), "0".into(), elapsed.to_string()])?;
            }
        }
        self.selection_log.flush()?;
        out.publish(Selection {
            set_beam: outcome.pair(),
        });
        self.outcome.send_replace(Some(outcome));
        Ok(())
    }

    fn on_kpi(&mut self, kpi: Kpi) -> IaResult<()> {
        self.kpi_count += 1;
        self.kpi_log.append([
            self.kpi_count.to_string(),
            kpi.tx.to_string(),
            kpi.rx.to_string(),
            kpi.val.to_string(),
        ])?;
        if self.active {
            self.buffer.record(kpi.pair(), kpi.val);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair(tx: i64, rx: i64) -> BeamPair {
        BeamPair::from_raw(tx, rx).unwrap()
    }

    #[test]
    fn test_highest_median_wins() {
        let mut buffer = SweepBuffer::new(0.0);
        for v in [2.0, 4.0, 6.0] {
            buffer.record(pair(1, 1), v);
        }
        buffer.record(pair(2, 2), 10.0);
        assert_eq!(
            buffer.decide(),
            SelectionOutcome::Winner {
                pair: pair(2, 2),
                kpi_median: 10.0
            }
        );
        assert_eq!(buffer.pair_count(), 2);
        assert_eq!(buffer.sample_count(), 4);
    }

    #[test]
    fn test_empty_buffer_fails() {
        let buffer = SweepBuffer::new(0.0);
        let outcome = buffer.decide();
        assert!(outcome.is_failed());
        assert_eq!(outcome.pair(), BORESIGHT);
    }

    #[test]
    fn test_tie_goes_to_lowest_pair() {
        let mut buffer = SweepBuffer::new(0.0);
        buffer.record(pair(5, 1), -40.0);
        buffer.record(pair(2, 9), -40.0);
        buffer.record(pair(2, 3), -40.0);
        assert_eq!(buffer.decide().pair(), pair(2, 3));
    }

    #[test]
    fn test_median_even_count_and_outlier() {
        assert_eq!(median(&[1.0, 3.0, 100.0, 2.0]), Some(2.5));
        assert_eq!(median(&[-50.0, 0.0, -51.0]), Some(-50.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_threshold_floor_is_linear_power() {
        // 1e-5 is -50 dB
        let mut buffer = SweepBuffer::new(1e-5);
        buffer.record(pair(1, 1), -60.0);
        assert!(buffer.decide().is_failed());
        buffer.record(pair(3, 3), -45.0);
        assert_eq!(buffer.decide().pair(), pair(3, 3));
    }

    #[test]
    fn test_positive_threshold_keeps_negative_db_winner() {
        let mut buffer = SweepBuffer::new(1.0e-6);
        buffer.record(pair(2, 2), -40.0);
        buffer.record(pair(4, 4), -80.0);
        assert_eq!(
            buffer.decide(),
            SelectionOutcome::Winner {
                pair: pair(2, 2),
                kpi_median: -40.0
            }
        );
    }

    fn config(dir: &tempfile::TempDir, threshold: f64) -> BeamSelectorConfig {
        BeamSelectorConfig {
            threshold,
            selection_log: dir.path().join("sel_pair.csv"),
            kpi_log: dir.path().join("sel_kpi.csv"),
        }
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = BeamSelector::new(config(&dir, -1.0)).err().unwrap();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_sweep_selects_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector = BeamSelector::new(config(&dir, 0.0)).unwrap();
        let mut selections = selector.selection_outlet().subscribe();
        let input = selector.input();
        selector.start().unwrap();

        input.send(Trigger::START.into()).unwrap();
        for v in [2.0, 4.0, 6.0] {
            input.send(Kpi::new(pair(1, 1), v).into()).unwrap();
        }
        input.send(Kpi::new(pair(2, 2), 10.0).into()).unwrap();
        input.send(Trigger::STOP.into()).unwrap();

        let sel = tokio::time::timeout(Duration::from_secs(5), selections.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sel.set_beam, pair(2, 2));
        selector.stop().await.unwrap();

        let log = std::fs::read_to_string(dir.path().join("sel_pair.csv")).unwrap();
        let rows: Vec<&str> = log.lines().collect();
        assert_eq!(rows[0], "#,tx,rx,kpi,elapsed");
        assert!(rows[1].starts_with("1,2,2,10,"));
        let kpis = std::fs::read_to_string(dir.path().join("sel_kpi.csv")).unwrap();
        assert_eq!(kpis.lines().count(), 5);
    }

    #[tokio::test]
    async fn test_empty_sweep_publishes_boresight() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector = BeamSelector::new(config(&dir, 0.0)).unwrap();
        let mut selections = selector.selection_outlet().subscribe();
        let mut outcome = selector.outcome();
        let input = selector.input();
        selector.start().unwrap();

        input.send(Trigger::START.into()).unwrap();
        input.send(Trigger::STOP.into()).unwrap();
        let sel = selections.recv().await.unwrap();
        assert_eq!(sel.set_beam, BORESIGHT);
        outcome.wait_for(|o| o.is_some()).await.unwrap();
        assert_eq!(*outcome.borrow(), Some(SelectionOutcome::Failed));
        selector.stop().await.unwrap();

        let log = std::fs::read_to_string(dir.path().join("sel_pair.csv")).unwrap();
        assert!(log.lines().nth(1).unwrap().starts_with("1,0,0,0,"));
    }

    #[tokio::test]
    async fn test_repeated_start_resets_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector = BeamSelector::new(config(&dir, 0.0)).unwrap();
        let mut selections = selector.selection_outlet().subscribe();
        let input = selector.input();
        selector.start().unwrap();

        input.send(Trigger::START.into()).unwrap();
        input.send(Kpi::new(pair(2, 2), 10.0).into()).unwrap();
        input.send(Trigger::START.into()).unwrap();
        input.send(Kpi::new(pair(1, 1), 1.0).into()).unwrap();
        input.send(Trigger::STOP.into()).unwrap();

        assert_eq!(selections.recv().await.unwrap().set_beam, pair(1, 1));
        selector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_kpi_rows_are_numbered_per_reading() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector = BeamSelector::new(config(&dir, 0.0)).unwrap();
        let input = selector.input();
        selector.start().unwrap();

        input.send(Trigger::START.into()).unwrap();
        for v in [-40.0, -41.0, -42.0] {
            input.send(Kpi::new(pair(1, 1), v).into()).unwrap();
        }
        selector.stop().await.unwrap();

        let kpis = std::fs::read_to_string(dir.path().join("sel_kpi.csv")).unwrap();
        let rows: Vec<&str> = kpis.lines().collect();
        assert_eq!(
            rows,
            vec!["#,tx,rx,kpi", "1,1,1,-40", "2,1,1,-41", "3,1,1,-42"]
        );
    }

    #[tokio::test]
    async fn test_stop_without_sweep_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector = BeamSelector::new(config(&dir, 0.0)).unwrap();
        let mut selections = selector.selection_outlet().subscribe();
        let input = selector.input();
        selector.start().unwrap();

        // readings outside a sweep are logged but never decide anything
        input.send(Kpi::new(pair(4, 4), 3.0).into()).unwrap();
        input.send(Trigger::STOP.into()).unwrap();
        selector.stop().await.unwrap();

        assert!(selections.try_recv().is_err());
        let kpis = std::fs::read_to_string(dir.path().join("sel_kpi.csv")).unwrap();
        assert_eq!(kpis.lines().nth(1), Some("1,4,4,3"));
    }
}
