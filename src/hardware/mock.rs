//! Mock Hardware Implementations
//!
//! Simulated radio front end for running initial access without hardware.
//! All timing uses tokio timers, so the mock runs under paused time in tests.
//!
//! `MockFrontEnd` plays both ends of the radio:
//!
//! - it consumes `gpio_cmd` messages, applies each masked write to a register
//!   image and latches the beam field into a unit on the falling edge of that
//!   unit's id-select line, exactly like the head units do;
//! - it produces a baseband stream whose received power depends on how far
//!   the latched TX/RX pair is from a hidden target pair, runs it through the
//!   RSS calculator and feeds the result to the KPI aggregator and the rate
//!   monitor.

use super::gpio::{GpioAttr, GpioLayout, RegisterWrite};
use crate::actors::{
    join_task, shutdown_channel, PowerSink, SampleCounter, ShutdownListener, ShutdownTrigger,
};
use crate::core::{BeamIndex, BeamPair, MhuId};
use crate::data::rss::RssCalculator;
use crate::error::{IaError, IaResult};
use crate::messages::GpioCmd;
use num_complex::Complex32;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info_span, trace, Instrument, Span};

/// Channel model and stream shape of the simulated link.
#[derive(Clone, Debug, PartialEq)]
pub struct MockFrontEndConfig {
    /// Pair with the best link.
    pub target: BeamPair,
    /// Time between sample batches.
    pub batch_period: Duration,
    /// Samples per batch.
    pub batch_size: usize,
    /// Received power on the target pair, dB.
    pub peak_db: f64,
    /// Loss per beam step away from the target, dB.
    pub loss_per_step_db: f64,
    /// Peak amplitude of the uniform I/Q noise.
    pub noise: f32,
    /// Fixed RNG seed; entropy when unset.
    pub seed: Option<u64>,
}

/// Register image of the GPIO bank plus the beams latched by each unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterImage {
    /// Direction-control register.
    pub ctrl: u32,
    /// Data-direction register.
    pub ddr: u32,
    /// Output register.
    pub out: u32,
    latched: [Option<BeamIndex>; 2],
}

impl RegisterImage {
    /// Beam latched by `unit`.
    pub fn latched(&self, unit: MhuId) -> Option<BeamIndex> {
        self.latched[usize::from(unit.number() - 1)]
    }

    fn apply(&mut self, write: &RegisterWrite, layout: &GpioLayout) {
        match write.attribute {
            GpioAttr::Ctrl => self.ctrl = write.apply(self.ctrl),
            GpioAttr::Ddr => self.ddr = write.apply(self.ddr),
            GpioAttr::Out => {
                let before = self.out;
                self.out = write.apply(before);
                for unit in MhuId::ALL {
                    let line = 1u32 << layout.id_bit(unit);
                    if before & line != 0 && self.out & line == 0 {
                        self.latch(unit, layout);
                    }
                }
            }
        }
    }

    fn latch(&mut self, unit: MhuId, layout: &GpioLayout) {
        let raw = (self.out & layout.beam_range.mask()) >> layout.beam_range.lower;
        match BeamIndex::new(i64::from(raw)) {
            Ok(beam) => {
                trace!("{} latched beam {}", unit, beam);
                self.latched[usize::from(unit.number() - 1)] = Some(beam);
            }
            Err(_) => debug!("{} latched invalid beam field {}", unit, raw),
        }
    }

    /// Pair formed by the unit in TX mode and the other unit.
    pub fn pair(&self, layout: &GpioLayout) -> Option<BeamPair> {
        let is_tx = |unit: MhuId| self.out & (1u32 << layout.mode_bit(unit)) != 0;
        let (tx, rx) = match (is_tx(MhuId::Mhu1), is_tx(MhuId::Mhu2)) {
            (true, false) => (MhuId::Mhu1, MhuId::Mhu2),
            (false, true) => (MhuId::Mhu2, MhuId::Mhu1),
            _ => return None,
        };
        Some(BeamPair::new(self.latched(tx)?, self.latched(rx)?))
    }
}

/// Simulated radio front end.
pub struct MockFrontEnd {
    config: MockFrontEndConfig,
    layout: GpioLayout,
    registers: Arc<Mutex<RegisterImage>>,
    rss: Option<RssCalculator>,
    inbox_tx: mpsc::UnboundedSender<GpioCmd>,
    inbox_rx: Option<mpsc::UnboundedReceiver<GpioCmd>>,
    shutdown: Option<ShutdownTrigger>,
    task: Option<JoinHandle<IaResult<()>>>,
    span: Span,
}

impl MockFrontEnd {
    /// Idle front end with blank registers.
    pub fn new(config: MockFrontEndConfig, layout: GpioLayout, rss: RssCalculator) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            config,
            layout,
            registers: Arc::new(Mutex::new(RegisterImage::default())),
            rss: Some(rss),
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            shutdown: None,
            task: None,
            span: info_span!("mock_front_end", component = "front_end"),
        }
    }

    /// Inbox for `gpio_cmd` messages.
    pub fn gpio_input(&self) -> mpsc::UnboundedSender<GpioCmd> {
        self.inbox_tx.clone()
    }

    /// Applies one command directly, bypassing the inbox.
    pub fn apply(&self, cmd: &GpioCmd) {
        self.registers.lock().apply(&cmd.gpio, &self.layout);
    }

    /// Snapshot of the register image.
    pub fn registers(&self) -> RegisterImage {
        self.registers.lock().clone()
    }

    /// Pair currently steered on the simulated heads.
    pub fn latched_pair(&self) -> Option<BeamPair> {
        self.registers.lock().pair(&self.layout)
    }

    /// Starts streaming into `sink` and `counter`.
    pub fn start(&mut self, sink: PowerSink, counter: SampleCounter) -> IaResult<()> {
        let (Some(inbox), Some(rss)) = (self.inbox_rx.take(), self.rss.take()) else {
            return Err(IaError::Validation("mock front end already started".into()));
        };
        if self.config.batch_period.is_zero() || self.config.batch_size == 0 {
            return Err(IaError::InvalidConfig(
                "front end needs a non-zero batch period and size".into(),
            ));
        }
        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let stream = Stream {
            channel: Channel::from(&self.config),
            layout: self.layout.clone(),
            registers: Arc::clone(&self.registers),
            rss,
            rng,
            sink,
            counter,
        };
        let (trigger, listener) = shutdown_channel();
        self.shutdown = Some(trigger);
        self.task = Some(tokio::spawn(
            stream
                .run(inbox, self.config.batch_period, listener)
                .instrument(self.span.clone()),
        ));
        Ok(())
    }

    /// Stops the stream.
    pub async fn stop(&mut self) -> IaResult<()> {
        if let Some(trigger) = self.shutdown.take() {
            trigger.fire();
        }
        join_task(self.task.take()).await
    }
}

#[derive(Clone, Copy, Debug)]
struct Channel {
    target: BeamPair,
    batch_size: usize,
    peak_db: f64,
    loss_per_step_db: f64,
    noise: f32,
}

impl From<&MockFrontEndConfig> for Channel {
    fn from(c: &MockFrontEndConfig) -> Self {
        Self {
            target: c.target,
            batch_size: c.batch_size,
            peak_db: c.peak_db,
            loss_per_step_db: c.loss_per_step_db,
            noise: c.noise,
        }
    }
}

impl Channel {
    /// Signal amplitude on `pair`, zero when nothing is latched.
    fn amplitude(&self, pair: Option<BeamPair>) -> f32 {
        let Some(pair) = pair else {
            return 0.0;
        };
        let steps = (i32::from(pair.tx.get()) - i32::from(self.target.tx.get())).abs()
            + (i32::from(pair.rx.get()) - i32::from(self.target.rx.get())).abs();
        let power_db = self.peak_db - self.loss_per_step_db * f64::from(steps);
        10f64.powf(power_db / 20.0) as f32
    }

    fn batch(&self, rng: &mut StdRng, pair: Option<BeamPair>) -> Vec<Complex32> {
        let amplitude = self.amplitude(pair);
        (0..self.batch_size)
            .map(|_| {
                let signal = Complex32::from_polar(amplitude, rng.gen_range(0.0..TAU));
                if self.noise > 0.0 {
                    let n = self.noise;
                    signal + Complex32::new(rng.gen_range(-n..n), rng.gen_range(-n..n))
                } else {
                    signal
                }
            })
            .collect()
    }
}

struct Stream {
    channel: Channel,
    layout: GpioLayout,
    registers: Arc<Mutex<RegisterImage>>,
    rss: RssCalculator,
    rng: StdRng,
    sink: PowerSink,
    counter: SampleCounter,
}

impl Stream {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<GpioCmd>,
        period: Duration,
        mut shutdown: ShutdownListener,
    ) -> IaResult<()> {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                msg = inbox.recv() => match msg {
                    Some(cmd) => self.registers.lock().apply(&cmd.gpio, &self.layout),
                    None => break,
                },
                _ = ticker.tick() => {
                    let pair = self.registers.lock().pair(&self.layout);
                    let samples = self.channel.batch(&mut self.rng, pair);
                    let levels = self.rss.process(&samples);
                    self.sink.push(&levels);
                    self.counter.add(samples.len());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RoleAssignment;
    use crate::hardware::gpio::tests::sample_layout;

    fn pair(tx: i64, rx: i64) -> BeamPair {
        BeamPair::from_raw(tx, rx).unwrap()
    }

    fn program(image: &mut RegisterImage, writes: &[RegisterWrite], layout: &GpioLayout) {
        for w in writes {
            image.apply(w, layout);
        }
    }

    #[test]
    fn test_latches_on_falling_edge_only() {
        let layout = sample_layout();
        let roles = RoleAssignment::parse("MHU1", "MHU2").unwrap();
        let mut image = RegisterImage::default();
        program(&mut image, &layout.setup_sequence(&roles), &layout);
        assert_eq!(image.ddr, 0x3FF);

        let writes = layout.beam_sequence(MhuId::Mhu1, BeamIndex::new(33).unwrap());
        program(&mut image, &writes[..2], &layout);
        assert_eq!(image.latched(MhuId::Mhu1), None, "select still high");
        image.apply(&writes[2], &layout);
        assert_eq!(image.latched(MhuId::Mhu1).map(BeamIndex::get), Some(33));
        assert_eq!(image.latched(MhuId::Mhu2), None);

        let rx = layout.beam_sequence(MhuId::Mhu2, BeamIndex::new(12).unwrap());
        program(&mut image, &rx, &layout);
        assert_eq!(image.pair(&layout), Some(pair(33, 12)));
    }

    #[test]
    fn test_pair_follows_mode_lines() {
        let layout = sample_layout();
        let roles = RoleAssignment::parse("MHU2", "MHU1").unwrap();
        let mut image = RegisterImage::default();
        program(&mut image, &layout.setup_sequence(&roles), &layout);
        program(
            &mut image,
            &layout.beam_sequence(MhuId::Mhu2, BeamIndex::new(7).unwrap()),
            &layout,
        );
        program(
            &mut image,
            &layout.beam_sequence(MhuId::Mhu1, BeamIndex::new(9).unwrap()),
            &layout,
        );
        assert_eq!(image.pair(&layout), Some(pair(7, 9)));
    }

    #[test]
    fn test_power_falls_off_with_distance() {
        let channel = Channel {
            target: pair(30, 34),
            batch_size: 64,
            peak_db: -30.0,
            loss_per_step_db: 3.0,
            noise: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(7);
        let mut rss = RssCalculator::new(16, 1000);
        let on_target = rss.process(&channel.batch(&mut rng, Some(pair(30, 34))));
        assert!((on_target[63] + 30.0).abs() < 1e-3);

        let mut rss = RssCalculator::new(16, 1000);
        let off_target = rss.process(&channel.batch(&mut rng, Some(pair(29, 36))));
        assert!((off_target[63] + 39.0).abs() < 1e-3);

        assert_eq!(channel.amplitude(None), 0.0);
    }
}
