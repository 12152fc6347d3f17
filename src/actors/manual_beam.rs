//! Manual beam control for diagnostics.
//!
//! Publishes `beam_id` on demand instead of sweeping: the initial pair once
//! on start, then single-sided updates.

use crate::core::{BeamIndex, BeamPair};
use crate::error::IaResult;
use crate::messages::{BeamId, Outlet};
use tracing::{info, info_span, Span};

/// Publishes beam commands on request instead of sweeping.
pub struct ManualBeam {
    current: BeamPair,
    beam_out: Outlet<BeamId>,
    span: Span,
}

impl ManualBeam {
    /// Starts from `initial`; nothing is published until `start()`.
    pub fn new(initial: BeamPair) -> Self {
        Self {
            current: initial,
            beam_out: Outlet::new("beam_id"),
            span: info_span!("manual_beam", component = "manual_beam"),
        }
    }

    /// `beam_id` output.
    pub fn beam_outlet(&mut self) -> &mut Outlet<BeamId> {
        &mut self.beam_out
    }

    /// Pair most recently requested.
    pub fn current(&self) -> BeamPair {
        self.current
    }

    /// Publishes the full current pair.
    pub fn start(&mut self) {
        let _enter = self.span.enter();
        info!("Applying initial beams {}", self.current);
        self.beam_out.publish(BeamId::pair(self.current));
    }

    /// Validates and publishes a TX-only update.
    pub fn set_tx_beam(&mut self, index: i64) -> IaResult<()> {
        let tx = BeamIndex::new(index)?;
        self.current.tx = tx;
        let _enter = self.span.enter();
        info!("TX beam -> {}", tx);
        self.beam_out.publish(BeamId::tx_only(tx));
        Ok(())
    }

    /// Validates and publishes an RX-only update.
    pub fn set_rx_beam(&mut self, index: i64) -> IaResult<()> {
        let rx = BeamIndex::new(index)?;
        self.current.rx = rx;
        let _enter = self.span.enter();
        info!("RX beam -> {}", rx);
        self.beam_out.publish(BeamId::rx_only(rx));
        Ok(())
    }
}
