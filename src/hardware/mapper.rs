//! Beam mapper: `beam_id` messages in, GPIO register writes out.
//!
//! The role assignment is fixed at construction and burned into the mode
//! lines by [`BeamMapper::setup`]. After that, each beam change for the TX or
//! RX role becomes the three-write select pulse from
//! [`GpioLayout::beam_sequence`]. Every write is followed by a settling pause
//! of `backoff + pulse`.

use super::gpio::{GpioLayout, RegisterWrite};
use crate::actors::{join_task, shutdown_channel, ShutdownListener, ShutdownTrigger};
use crate::core::{BeamIndex, MhuId, MhuRole, RoleAssignment};
use crate::error::{IaError, IaResult};
use crate::messages::{BeamId, GpioCmd, Outlet};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument, Span};

/// One physical unit and the beam it currently holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Head {
    unit: MhuId,
    role: MhuRole,
    beam: Option<BeamIndex>,
}

struct MapperCore {
    layout: GpioLayout,
    roles: RoleAssignment,
    settle: Duration,
    heads: [Head; 2],
    configured: bool,
}

impl MapperCore {
    async fn write(&self, write: RegisterWrite, out: &mut Outlet<GpioCmd>) {
        debug!("{} {:#x} mask {:#x}", write.attribute, write.value, write.mask);
        out.publish(GpioCmd { gpio: write });
        tokio::time::sleep(self.settle).await;
    }

    async fn setup(&mut self, out: &mut Outlet<GpioCmd>) -> usize {
        let writes = self.layout.setup_sequence(&self.roles);
        let count = writes.len();
        for write in writes {
            self.write(write, out).await;
        }
        self.configured = true;
        info!(
            "GPIO configured, mask {:#b}, TX {:?}, RX {:?}",
            self.layout.combined_mask(),
            self.roles.unit_for(MhuRole::Tx),
            self.roles.unit_for(MhuRole::Rx)
        );
        count
    }

    fn beam_for(&self, role: MhuRole) -> Option<BeamIndex> {
        self.heads.iter().find(|h| h.role == role)?.beam
    }

    async fn steer(&mut self, role: MhuRole, beam: BeamIndex, out: &mut Outlet<GpioCmd>) -> usize {
        if role == MhuRole::Disabled {
            return 0;
        }
        let Some(head) = self.heads.iter_mut().find(|h| h.role == role) else {
            debug!("No unit holds the {:?} role, beam {} ignored", role, beam);
            return 0;
        };
        if head.beam == Some(beam) {
            debug!("{} already on beam {}, skipping", head.unit, beam);
            return 0;
        }
        head.beam = Some(beam);
        let unit = head.unit;

        let writes = self.layout.beam_sequence(unit, beam);
        let count = writes.len();
        for write in writes {
            self.write(write, out).await;
        }
        debug!("{} ({:?}) steered to beam {}", unit, role, beam);
        count
    }

    async fn apply(&mut self, beam: BeamId, out: &mut Outlet<GpioCmd>) -> usize {
        let mut writes = 0;
        if let Some(tx) = beam.tx() {
            writes += self.steer(MhuRole::Tx, tx, out).await;
        }
        if let Some(rx) = beam.rx() {
            writes += self.steer(MhuRole::Rx, rx, out).await;
        }
        writes
    }
}

/// Beam mapper component.
pub struct BeamMapper {
    core: Option<MapperCore>,
    gpio_out: Outlet<GpioCmd>,
    inbox_tx: mpsc::UnboundedSender<BeamId>,
    inbox_rx: Option<mpsc::UnboundedReceiver<BeamId>>,
    shutdown: Option<ShutdownTrigger>,
    task: Option<JoinHandle<IaResult<()>>>,
    span: Span,
}

impl BeamMapper {
    /// Builds a mapper for a fixed role assignment. `backoff + pulse` is paused after every write.
    pub fn new(
        roles: RoleAssignment,
        layout: GpioLayout,
        backoff: Duration,
        pulse: Duration,
    ) -> Self {
        let heads = MhuId::ALL.map(|unit| Head {
            unit,
            role: roles.role_of(unit),
            beam: None,
        });
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            core: Some(MapperCore {
                layout,
                roles,
                settle: backoff + pulse,
                heads,
                configured: false,
            }),
            gpio_out: Outlet::new("gpio_cmd"),
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            shutdown: None,
            task: None,
            span: info_span!("beam_mapper", component = "beam_mapper"),
        }
    }

    /// Parses the role aliases and loads the GPIO layout document.
    pub fn from_config(
        tx_mhu: &str,
        rx_mhu: &str,
        gpio_config: impl AsRef<Path>,
        backoff: Duration,
        pulse: Duration,
    ) -> IaResult<Self> {
        let roles = RoleAssignment::parse(tx_mhu, rx_mhu)?;
        let layout = GpioLayout::load(gpio_config)?;
        Ok(Self::new(roles, layout, backoff, pulse))
    }

    /// Inbox for `beam_id`; served once started.
    pub fn input(&self) -> mpsc::UnboundedSender<BeamId> {
        self.inbox_tx.clone()
    }

    /// `gpio_cmd` output; connect before `start()`.
    pub fn gpio_outlet(&mut self) -> &mut Outlet<GpioCmd> {
        &mut self.gpio_out
    }

    fn core_mut(&mut self) -> IaResult<(&mut MapperCore, &mut Outlet<GpioCmd>)> {
        match self.core.as_mut() {
            Some(core) => Ok((core, &mut self.gpio_out)),
            None => Err(IaError::Validation(
                "beam mapper is running; send beam_id to its input instead".into(),
            )),
        }
    }

    /// Initialises the bank and burns in the roles. Returns the write count.
    ///
    /// Runs once; a second call is rejected so the role lines are never
    /// re-driven.
    pub async fn setup(&mut self) -> IaResult<usize> {
        let span = self.span.clone();
        let (core, out) = self.core_mut()?;
        if core.configured {
            return Err(IaError::Validation("beam mapper is already set up".into()));
        }
        Ok(core.setup(out).instrument(span).await)
    }

    /// Steers the TX unit. Returns the number of writes issued.
    pub async fn set_tx_beam(&mut self, index: i64) -> IaResult<usize> {
        self.set_beam(MhuRole::Tx, index).await
    }

    /// Steers the RX unit. Returns the number of writes issued.
    pub async fn set_rx_beam(&mut self, index: i64) -> IaResult<usize> {
        self.set_beam(MhuRole::Rx, index).await
    }

    async fn set_beam(&mut self, role: MhuRole, index: i64) -> IaResult<usize> {
        let beam = BeamIndex::new(index)?;
        let span = self.span.clone();
        let (core, out) = self.core_mut()?;
        if !core.configured {
            return Err(IaError::Validation(
                "beam mapper must be set up before steering".into(),
            ));
        }
        Ok(core.steer(role, beam, out).instrument(span).await)
    }

    /// Beam currently applied for `role`, if any.
    pub fn beam_for(&self, role: MhuRole) -> Option<BeamIndex> {
        self.core.as_ref()?.beam_for(role)
    }

    /// Runs setup (unless already done), then serves the inbox.
    pub fn start(&mut self) -> IaResult<()> {
        let (Some(core), Some(inbox)) = (self.core.take(), self.inbox_rx.take()) else {
            return Err(IaError::Validation("beam mapper already started".into()));
        };
        let out = std::mem::replace(&mut self.gpio_out, Outlet::new("gpio_cmd"));
        let (trigger, listener) = shutdown_channel();
        self.shutdown = Some(trigger);
        self.task = Some(tokio::spawn(
            serve(core, out, inbox, listener).instrument(self.span.clone()),
        ));
        Ok(())
    }

    /// Stops the task after the queued commands are written.
    pub async fn stop(&mut self) -> IaResult<()> {
        if let Some(trigger) = self.shutdown.take() {
            trigger.fire();
        }
        join_task(self.task.take()).await
    }
}

async fn serve(
    mut core: MapperCore,
    mut out: Outlet<GpioCmd>,
    mut inbox: mpsc::UnboundedReceiver<BeamId>,
    mut shutdown: ShutdownListener,
) -> IaResult<()> {
    if !core.configured {
        core.setup(&mut out).await;
    }
    loop {
        tokio::select! {
            biased;
            msg = inbox.recv() => match msg {
                Some(beam) => {
                    core.apply(beam, &mut out).await;
                }
                None => break,
            },
            _ = shutdown.requested() => break,
        }
    }
    Ok(())
}
