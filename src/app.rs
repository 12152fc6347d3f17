//! Application pipelines.
//!
//! [`InitialAccess`] wires the full IA graph:
//!
//! ```text
//!            trigger ┌──────────────► KpiAggregator ──kpi──┐
//!  SweepController ──┼──────────────► RateMonitor          ▼
//!       ▲    │       └──────────────────────────────► BeamSelector
//!       │    │ beam_id ─► BeamMapper ─► gpio_cmd            │
//!       │    └─────────► KpiAggregator                      │
//!       └───────────────────── selection ───────────────────┘
//! ```
//!
//! Front-end ports ([`PowerSink`], [`SampleCounter`]) and the `gpio_cmd`
//! outlet are exposed for whatever drives the radio, real or simulated.
//!
//! [`ManualControl`] is the diagnostic variant: ManualBeam → BeamMapper.

use crate::actors::{
    collect_errors, BeamSelector, KpiAggregator, ManualBeam, PowerSink, RateMonitor, RateReport,
    SampleCounter, SweepController, SweepStatus,
};
use crate::config::Settings;
use crate::core::{BeamIndex, BeamPair, SelectionOutcome};
use crate::error::IaResult;
use crate::hardware::BeamMapper;
use crate::messages::{GpioCmd, Outlet};
use tokio::sync::watch;
use tracing::info;

/// The complete initial-access pipeline.
pub struct InitialAccess {
    sweep: SweepController,
    kpi: KpiAggregator,
    rate: RateMonitor,
    selector: BeamSelector,
    mapper: BeamMapper,
}

impl InitialAccess {
    /// Builds every component from `settings`, loading the GPIO layout from
    /// `mapper.gpio_config`.
    pub fn from_settings(settings: &Settings) -> IaResult<Self> {
        let mapper = BeamMapper::from_config(
            &settings.mapper.tx_mhu,
            &settings.mapper.rx_mhu,
            &settings.mapper.gpio_config,
            settings.mapper.backoff,
            settings.mapper.pulse,
        )?;
        Self::with_mapper(settings, mapper)
    }

    /// Builds the pipeline around an already constructed mapper.
    pub fn with_mapper(settings: &Settings, mapper: BeamMapper) -> IaResult<Self> {
        settings.validate()?;
        let mut sweep = SweepController::new(settings.sweep_config()?)?;
        let mut kpi = KpiAggregator::new(settings.kpi_config())?;
        let rate = RateMonitor::new(settings.rate_config())?;
        let mut selector = BeamSelector::new(settings.selector_config())?;

        let trigger = sweep.trigger_outlet();
        trigger.connect(kpi.input());
        trigger.connect(rate.input());
        trigger.connect(selector.input());

        let beam = sweep.beam_outlet();
        beam.connect(mapper.input());
        beam.connect(kpi.input());

        kpi.kpi_outlet().connect(selector.input());
        selector.selection_outlet().connect(sweep.selection_input());

        Ok(Self {
            sweep,
            kpi,
            rate,
            selector,
            mapper,
        })
    }

    /// `gpio_cmd` output of the mapper; connect before `start()`.
    pub fn gpio_outlet(&mut self) -> &mut Outlet<GpioCmd> {
        self.mapper.gpio_outlet()
    }

    /// Handle for the front end's power batches.
    pub fn power_sink(&self) -> PowerSink {
        self.kpi.power_sink()
    }

    /// Handle for the front end's sample count.
    pub fn sample_counter(&self) -> SampleCounter {
        self.rate.counter()
    }

    /// Sweep phase and active pair.
    pub fn sweep_status(&self) -> watch::Receiver<SweepStatus> {
        self.sweep.status()
    }

    /// Outcome of the most recent sweep.
    pub fn selection_outcome(&self) -> watch::Receiver<Option<SelectionOutcome>> {
        self.selector.outcome()
    }

    /// Throughput and overhead of the last window.
    pub fn rate_report(&self) -> watch::Receiver<RateReport> {
        self.rate.report()
    }

    /// Stages TX candidates for the next cycle.
    pub fn set_tx_candidates(&self, beams: Vec<BeamIndex>) -> IaResult<()> {
        self.sweep.set_tx_candidates(beams)
    }

    /// Stages RX candidates for the next cycle.
    pub fn set_rx_candidates(&self, beams: Vec<BeamIndex>) -> IaResult<()> {
        self.sweep.set_rx_candidates(beams)
    }

    /// Starts consumers before producers; the sweep goes last.
    pub fn start(&mut self) -> IaResult<()> {
        self.mapper.start()?;
        self.selector.start()?;
        self.kpi.start()?;
        self.rate.start()?;
        self.sweep.start()?;
        info!("Initial access pipeline started");
        Ok(())
    }

    /// Stops producers first, then consumers, and reports every failure.
    pub async fn stop(&mut self) -> IaResult<()> {
        let results = vec![
            self.sweep.stop().await,
            self.kpi.stop().await,
            self.rate.stop().await,
            self.selector.stop().await,
            self.mapper.stop().await,
        ];
        info!("Initial access pipeline stopped");
        collect_errors(results)
    }
}

/// Manual beam steering: ManualBeam → BeamMapper.
pub struct ManualControl {
    manual: ManualBeam,
    mapper: BeamMapper,
}

impl ManualControl {
    /// Connects a fresh ManualBeam to `mapper`.
    pub fn new(initial: BeamPair, mapper: BeamMapper) -> Self {
        let mut manual = ManualBeam::new(initial);
        manual.beam_outlet().connect(mapper.input());
        Self { manual, mapper }
    }

    /// Builds the mapper from the `[mapper]` settings.
    pub fn from_settings(settings: &Settings, initial: BeamPair) -> IaResult<Self> {
        let mapper = BeamMapper::from_config(
            &settings.mapper.tx_mhu,
            &settings.mapper.rx_mhu,
            &settings.mapper.gpio_config,
            settings.mapper.backoff,
            settings.mapper.pulse,
        )?;
        Ok(Self::new(initial, mapper))
    }

    /// `gpio_cmd` output of the mapper; connect before `start()`.
    pub fn gpio_outlet(&mut self) -> &mut Outlet<GpioCmd> {
        self.mapper.gpio_outlet()
    }

    /// Starts the mapper (which runs setup) and applies the initial pair.
    pub fn start(&mut self) -> IaResult<()> {
        self.mapper.start()?;
        self.manual.start();
        Ok(())
    }

    /// Steers the TX unit.
    pub fn set_tx_beam(&mut self, index: i64) -> IaResult<()> {
        self.manual.set_tx_beam(index)
    }

    /// Steers the RX unit.
    pub fn set_rx_beam(&mut self, index: i64) -> IaResult<()> {
        self.manual.set_rx_beam(index)
    }

    /// Pair most recently requested.
    pub fn current(&self) -> BeamPair {
        self.manual.current()
    }

    /// Stops the mapper once its queued commands are written.
    pub async fn stop(&mut self) -> IaResult<()> {
        self.mapper.stop().await
    }
}
