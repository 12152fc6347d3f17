//! Beam sweep controller.
//!
//! Drives the TX x RX cross-product on a timer. One cycle:
//!
//! ```text
//! trigger(start) -> beam_id(t1,r1) .. beam_id(tn,rm) -> trigger(stop)
//!   -> wait for selection -> beam_id(winner) -> cooldown
//! ```
//!
//! TX is the outer loop, RX the inner one, with `beam_period` between
//! emissions. In standalone mode no triggers are emitted and no selection is
//! awaited, which is what manual diagnostic sweeps use.
//!
//! Candidate replacements requested while a sweep runs are staged and only
//! swapped in at the start of the next cycle.

use super::{join_task, shutdown_channel, ShutdownListener, ShutdownTrigger};
use crate::core::{BeamIndex, BeamPair, BORESIGHT};
use crate::error::{IaError, IaResult};
use crate::messages::{BeamId, Outlet, Selection, Trigger};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Sweep parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepConfig {
    /// TX candidates, the outer loop.
    pub tx_beams: Vec<BeamIndex>,
    /// RX candidates, the inner loop.
    pub rx_beams: Vec<BeamIndex>,
    /// Dwell time per beam pair.
    pub beam_period: Duration,
    /// Cooldown after applying the winner.
    pub interval: Duration,
    /// Sweep without triggers or selections.
    pub standalone: bool,
    /// Give up on a selection after this long and apply boresight.
    pub selection_timeout: Option<Duration>,
}

impl SweepConfig {
    /// Rejects empty candidate lists.
    pub fn validate(&self) -> IaResult<()> {
        check_candidates("TX", &self.tx_beams)?;
        check_candidates("RX", &self.rx_beams)
    }
}

fn check_candidates(side: &str, beams: &[BeamIndex]) -> IaResult<()> {
    if beams.is_empty() {
        return Err(IaError::InvalidConfig(format!(
            "{} candidate list must not be empty",
            side
        )));
    }
    Ok(())
}

/// Where the controller is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepPhase {
    /// Not started, or stopped.
    Idle,
    /// Emitting candidate pairs.
    Sweeping,
    /// Sweep done, waiting for the selector.
    AwaitingSelection,
    /// Winner applied, waiting out the interval.
    Cooling,
}

/// Snapshot of the controller state, published on every transition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepStatus {
    /// Current phase.
    pub phase: SweepPhase,
    /// Number of the current cycle, from 1.
    pub cycle: u64,
    /// Pair most recently steered to.
    pub active_pair: Option<BeamPair>,
    /// True while the loop task runs.
    pub running: bool,
}

impl Default for SweepStatus {
    fn default() -> Self {
        Self {
            phase: SweepPhase::Idle,
            cycle: 0,
            active_pair: None,
            running: false,
        }
    }
}

#[derive(Debug, Default)]
struct StagedCandidates {
    tx: Option<Vec<BeamIndex>>,
    rx: Option<Vec<BeamIndex>>,
}

/// Sweep controller component.
pub struct SweepController {
    config: SweepConfig,
    trigger_out: Outlet<Trigger>,
    beam_out: Outlet<BeamId>,
    selection_tx: mpsc::UnboundedSender<Selection>,
    selection_rx: Option<mpsc::UnboundedReceiver<Selection>>,
    staged: Arc<Mutex<StagedCandidates>>,
    status_tx: Option<watch::Sender<SweepStatus>>,
    status_rx: watch::Receiver<SweepStatus>,
    shutdown: Option<ShutdownTrigger>,
    task: Option<JoinHandle<IaResult<()>>>,
    span: Span,
}

impl SweepController {
    /// Validates the candidate lists.
    pub fn new(config: SweepConfig) -> IaResult<Self> {
        config.validate()?;
        let (selection_tx, selection_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SweepStatus::default());
        Ok(Self {
            config,
            trigger_out: Outlet::new("trigger"),
            beam_out: Outlet::new("beam_id"),
            selection_tx,
            selection_rx: Some(selection_rx),
            staged: Arc::new(Mutex::new(StagedCandidates::default())),
            status_tx: Some(status_tx),
            status_rx,
            shutdown: None,
            task: None,
            span: info_span!("beam_sweep", component = "beam_sweep"),
        })
    }

    /// `trigger` output; connect before `start()`.
    pub fn trigger_outlet(&mut self) -> &mut Outlet<Trigger> {
        &mut self.trigger_out
    }

    /// `beam_id` output; connect before `start()`.
    pub fn beam_outlet(&mut self) -> &mut Outlet<BeamId> {
        &mut self.beam_out
    }

    /// Inbox for `selection` messages.
    pub fn selection_input(&self) -> mpsc::UnboundedSender<Selection> {
        self.selection_tx.clone()
    }

    /// Watch channel following every phase change.
    pub fn status(&self) -> watch::Receiver<SweepStatus> {
        self.status_rx.clone()
    }

    /// Stages a new TX candidate list for the next cycle.
    pub fn set_tx_candidates(&self, beams: Vec<BeamIndex>) -> IaResult<()> {
        check_candidates("TX", &beams)?;
        self.span.in_scope(|| info!("Changing TX candidates to {:?}", beams));
        self.staged.lock().tx = Some(beams);
        Ok(())
    }

    /// Stages a new RX candidate list for the next cycle.
    pub fn set_rx_candidates(&self, beams: Vec<BeamIndex>) -> IaResult<()> {
        check_candidates("RX", &beams)?;
        self.span.in_scope(|| info!("Changing RX candidates to {:?}", beams));
        self.staged.lock().rx = Some(beams);
        Ok(())
    }

    /// Spawns the timing loop.
    pub fn start(&mut self) -> IaResult<()> {
        let (Some(selections), Some(status)) = (self.selection_rx.take(), self.status_tx.take())
        else {
            return Err(IaError::Validation("sweep controller already started".into()));
        };
        let (trigger, listener) = shutdown_channel();
        let sweep = SweepLoop {
            tx_beams: self.config.tx_beams.clone(),
            rx_beams: self.config.rx_beams.clone(),
            beam_period: self.config.beam_period,
            interval: self.config.interval,
            standalone: self.config.standalone,
            selection_timeout: self.config.selection_timeout,
            staged: Arc::clone(&self.staged),
            trigger_out: std::mem::replace(&mut self.trigger_out, Outlet::new("trigger")),
            beam_out: std::mem::replace(&mut self.beam_out, Outlet::new("beam_id")),
            selections,
            status,
            shutdown: listener,
        };
        self.shutdown = Some(trigger);
        self.task = Some(tokio::spawn(sweep.run().instrument(self.span.clone())));
        Ok(())
    }

    /// Signals the loop and waits for it to exit.
    pub async fn stop(&mut self) -> IaResult<()> {
        if let Some(trigger) = self.shutdown.take() {
            trigger.fire();
        }
        join_task(self.task.take()).await
    }
}

struct SweepLoop {
    tx_beams: Vec<BeamIndex>,
    rx_beams: Vec<BeamIndex>,
    beam_period: Duration,
    interval: Duration,
    standalone: bool,
    selection_timeout: Option<Duration>,
    staged: Arc<Mutex<StagedCandidates>>,
    trigger_out: Outlet<Trigger>,
    beam_out: Outlet<BeamId>,
    selections: mpsc::UnboundedReceiver<Selection>,
    status: watch::Sender<SweepStatus>,
    shutdown: ShutdownListener,
}

impl SweepLoop {
    async fn run(mut self) -> IaResult<()> {
        let mut cycle = 0u64;
        self.status.send_modify(|s| s.running = true);

        'cycles: while !self.shutdown.is_requested() {
            cycle += 1;
            if !self.standalone {
                info!("Start the IA procedure #{}", cycle);
                self.trigger_out.publish(Trigger::START);
            }
            self.swap_in_staged();
            self.status.send_modify(|s| {
                s.phase = SweepPhase::Sweeping;
                s.cycle = cycle;
            });

            let tx_beams = self.tx_beams.clone();
            let rx_beams = self.rx_beams.clone();
            for &tx in &tx_beams {
                for &rx in &rx_beams {
                    self.apply(BeamPair::new(tx, rx));
                    if !self.shutdown.sleep(self.beam_period).await {
                        break 'cycles;
                    }
                }
            }

            if self.standalone {
                continue;
            }

            // A selection still queued here belongs to an earlier cycle.
            while let Ok(stale) = self.selections.try_recv() {
                debug!("Dropping stale selection {}", stale.set_beam);
            }
            self.trigger_out.publish(Trigger::STOP);
            info!("Stop the IA procedure #{}", cycle);
            self.status
                .send_modify(|s| s.phase = SweepPhase::AwaitingSelection);

            let Some(winner) = self.await_selection().await else {
                break;
            };
            self.apply(winner);
            self.status.send_modify(|s| s.phase = SweepPhase::Cooling);
            if !self.shutdown.sleep(self.interval).await {
                break;
            }
        }

        self.status.send_modify(|s| {
            s.phase = SweepPhase::Idle;
            s.running = false;
        });
        info!("Sweep loop stopped after {} cycle(s)", cycle);
        Ok(())
    }

    fn swap_in_staged(&mut self) {
        let mut staged = self.staged.lock();
        if let Some(tx) = staged.tx.take() {
            self.tx_beams = tx;
        }
        if let Some(rx) = staged.rx.take() {
            self.rx_beams = rx;
        }
    }

    fn apply(&mut self, pair: BeamPair) {
        debug!("Steering to {}", pair);
        self.beam_out.publish(BeamId::pair(pair));
        self.status.send_modify(|s| s.active_pair = Some(pair));
    }

    /// Waits for the selector's answer. `None` means shutdown was requested.
    async fn await_selection(&mut self) -> Option<BeamPair> {
        tokio::select! {
            msg = self.selections.recv() => msg.map(|sel| sel.set_beam),
            _ = self.shutdown.requested() => None,
            _ = sleep_for(self.selection_timeout) => {
                warn!("No selection received in time, resetting to boresight");
                Some(BORESIGHT)
            }
        }
    }
}

async fn sleep_for(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Event {
        Trigger(bool),
        Beam(BeamPair),
    }

    impl From<Trigger> for Event {
        fn from(t: Trigger) -> Self {
            Event::Trigger(t.is_start())
        }
    }

    impl From<BeamId> for Event {
        fn from(b: BeamId) -> Self {
            Event::Beam(b.as_pair().unwrap())
        }
    }

    fn beams(raw: &[i64]) -> Vec<BeamIndex> {
        raw.iter().map(|&b| BeamIndex::new(b).unwrap()).collect()
    }

    fn pair(tx: i64, rx: i64) -> BeamPair {
        BeamPair::from_raw(tx, rx).unwrap()
    }

    fn config(tx: &[i64], rx: &[i64], standalone: bool) -> SweepConfig {
        SweepConfig {
            tx_beams: beams(tx),
            rx_beams: beams(rx),
            beam_period: Duration::from_millis(100),
            interval: Duration::from_secs(1),
            standalone,
            selection_timeout: None,
        }
    }

    fn wire(sweep: &mut SweepController) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        sweep.trigger_outlet().connect(tx.clone());
        sweep.beam_outlet().connect(tx);
        rx
    }

    #[test]
    fn test_empty_candidates_rejected() {
        let err = SweepController::new(config(&[], &[1], false)).err().unwrap();
        assert!(matches!(err, IaError::InvalidConfig(_)));
        let sweep = SweepController::new(config(&[1], &[1], false)).unwrap();
        assert!(matches!(
            sweep.set_rx_candidates(Vec::new()),
            Err(IaError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_order_and_spacing() {
        let mut sweep = SweepController::new(config(&[1, 2], &[3, 4, 5], false)).unwrap();
        let mut events = wire(&mut sweep);
        let selection = sweep.selection_input();
        sweep.start().unwrap();

        let mut timeline = Vec::new();
        while let Some(event) = events.recv().await {
            timeline.push((Instant::now(), event));
            if event == Event::Trigger(false) {
                selection.send(Selection { set_beam: pair(2, 4) }).unwrap();
            }
            if timeline.len() == 9 {
                break;
            }
        }
        sweep.stop().await.unwrap();

        let kinds: Vec<Event> = timeline.iter().map(|(_, e)| *e).collect();
        let mut expected = vec![Event::Trigger(true)];
        for tx in [1, 2] {
            for rx in [3, 4, 5] {
                expected.push(Event::Beam(pair(tx, rx)));
            }
        }
        expected.push(Event::Trigger(false));
        expected.push(Event::Beam(pair(2, 4)));
        assert_eq!(kinds, expected);

        for window in timeline[1..7].windows(2) {
            assert!(window[1].0 - window[0].0 >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_awaiting_selection() {
        let mut sweep = SweepController::new(config(&[1], &[1], false)).unwrap();
        let mut events = wire(&mut sweep);
        let mut status = sweep.status();
        sweep.start().unwrap();

        while let Some(event) = events.recv().await {
            if event == Event::Trigger(false) {
                break;
            }
        }
        status
            .wait_for(|s| s.phase == SweepPhase::AwaitingSelection)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), sweep.stop())
            .await
            .expect("stop must not hang on a missing selection")
            .unwrap();
        assert!(!sweep.status().borrow().running);
        assert_eq!(sweep.status().borrow().phase, SweepPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_timeout_applies_boresight() {
        let mut cfg = config(&[1], &[2], false);
        cfg.selection_timeout = Some(Duration::from_millis(500));
        let mut sweep = SweepController::new(cfg).unwrap();
        let mut events = wire(&mut sweep);
        sweep.start().unwrap();

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
            if seen.len() == 4 {
                break;
            }
        }
        sweep.stop().await.unwrap();
        assert_eq!(
            seen,
            vec![
                Event::Trigger(true),
                Event::Beam(pair(1, 2)),
                Event::Trigger(false),
                Event::Beam(BORESIGHT),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_standalone_swaps_candidates_at_cycle_boundary() {
        let mut sweep = SweepController::new(config(&[1], &[1, 2], true)).unwrap();
        let mut events = wire(&mut sweep);
        sweep.start().unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first, Event::Beam(pair(1, 1)));
        sweep.set_rx_candidates(beams(&[7])).unwrap();

        let mut rest = Vec::new();
        while let Some(event) = events.recv().await {
            rest.push(event);
            if rest.len() == 3 {
                break;
            }
        }
        sweep.stop().await.unwrap();
        // The running cycle finishes on the old list, no triggers in standalone.
        assert_eq!(
            rest,
            vec![
                Event::Beam(pair(1, 2)),
                Event::Beam(pair(1, 7)),
                Event::Beam(pair(1, 7)),
            ]
        );
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let mut sweep = SweepController::new(config(&[1], &[1], true)).unwrap();
        sweep.start().unwrap();
        assert!(sweep.start().is_err());
        sweep.stop().await.unwrap();
        // stop is idempotent
        sweep.stop().await.unwrap();
    }
}
