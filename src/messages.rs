//! Message types for component-to-component communication
//!
//! Every edge of the initial-access graph carries one of the payloads below.
//! Their serde shapes are the wire shapes of the message protocol:
//!
//! ```text
//! trigger    {"trigger": bool}
//! beam_id    {"tx"?: int, "rx"?: int}          (at least one key)
//! kpi        {"val": float, "tx": int, "rx": int}
//! selection  {"set_beam": {"tx": int, "rx": int}}
//! gpio_cmd   {"gpio": {"bank": str, "attr": "CTRL"|"DDR"|"OUT", "value": uint, "mask": uint}}
//! ```
//!
//! Malformed payloads (missing keys, out-of-range indices) fail to decode, so
//! a component never sees a half-valid message.
//!
//! Delivery goes through [`Outlet`], a fan-out publisher holding one unbounded
//! channel per connected edge: fire-and-forget, FIFO per edge, no ordering
//! between different senders.

use crate::core::{BeamIndex, BeamPair};
use crate::error::{IaError, IaResult};
use crate::hardware::gpio::RegisterWrite;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Start/stop of an IA sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// `true` starts a sweep, `false` ends it.
    pub trigger: bool,
}

impl Trigger {
    /// Start of a sweep.
    pub const START: Trigger = Trigger { trigger: true };
    /// End of a sweep.
    pub const STOP: Trigger = Trigger { trigger: false };

    /// True for a start trigger.
    pub fn is_start(self) -> bool {
        self.trigger
    }
}

#[derive(Deserialize)]
struct RawBeamId {
    tx: Option<i64>,
    rx: Option<i64>,
}

/// Beam command naming a TX index, an RX index, or both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBeamId")]
pub struct BeamId {
    #[serde(skip_serializing_if = "Option::is_none")]
    tx: Option<BeamIndex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rx: Option<BeamIndex>,
}

impl BeamId {
    /// Builds a command; at least one side must be present.
    pub fn new(tx: Option<BeamIndex>, rx: Option<BeamIndex>) -> IaResult<Self> {
        if tx.is_none() && rx.is_none() {
            return Err(IaError::Validation(
                "beam_id names neither a TX nor an RX beam".into(),
            ));
        }
        Ok(Self { tx, rx })
    }

    /// Command naming both sides.
    pub fn pair(pair: BeamPair) -> Self {
        Self {
            tx: Some(pair.tx),
            rx: Some(pair.rx),
        }
    }

    /// Command for the TX side only.
    pub fn tx_only(tx: BeamIndex) -> Self {
        Self { tx: Some(tx), rx: None }
    }

    /// Command for the RX side only.
    pub fn rx_only(rx: BeamIndex) -> Self {
        Self { tx: None, rx: Some(rx) }
    }

    /// Requested TX beam.
    pub fn tx(&self) -> Option<BeamIndex> {
        self.tx
    }

    /// Requested RX beam.
    pub fn rx(&self) -> Option<BeamIndex> {
        self.rx
    }

    /// Both sides, when the command names a full pair.
    pub fn as_pair(&self) -> Option<BeamPair> {
        Some(BeamPair::new(self.tx?, self.rx?))
    }
}

impl TryFrom<RawBeamId> for BeamId {
    type Error = IaError;

    fn try_from(raw: RawBeamId) -> IaResult<Self> {
        let tx = raw.tx.map(BeamIndex::new).transpose()?;
        let rx = raw.rx.map(BeamIndex::new).transpose()?;
        BeamId::new(tx, rx)
    }
}

/// One KPI reading for the pair that was active when it was measured.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kpi {
    /// KPI value, dB.
    pub val: f64,
    /// TX beam of the measured pair.
    pub tx: BeamIndex,
    /// RX beam of the measured pair.
    pub rx: BeamIndex,
}

impl Kpi {
    /// Reading `val` for `pair`.
    pub fn new(pair: BeamPair, val: f64) -> Self {
        Self {
            val,
            tx: pair.tx,
            rx: pair.rx,
        }
    }

    /// Measured pair.
    pub fn pair(&self) -> BeamPair {
        BeamPair::new(self.tx, self.rx)
    }
}

/// Pair chosen by the selector at the end of a sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Pair to steer to.
    pub set_beam: BeamPair,
}

/// Register write for the radio front-end driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpioCmd {
    /// The write to perform.
    pub gpio: RegisterWrite,
}

// =============================================================================
// Outlet
// =============================================================================

type Deliver<T> = Box<dyn Fn(T) -> bool + Send + Sync>;

/// Fan-out publisher for one output port.
pub struct Outlet<T> {
    port: &'static str,
    edges: Vec<Deliver<T>>,
}

impl<T> std::fmt::Debug for Outlet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outlet")
            .field("port", &self.port)
            .field("edges", &self.edges.len())
            .finish()
    }
}

impl<T> Outlet<T>
where
    T: Clone + Send + 'static,
{
    /// Outlet with no edges yet.
    pub fn new(port: &'static str) -> Self {
        Self {
            port,
            edges: Vec::new(),
        }
    }

    /// Name of the port, as used in logs.
    pub fn port(&self) -> &'static str {
        self.port
    }

    /// Connects an inbox whose message type can be built from `T`.
    pub fn connect<I>(&mut self, inbox: mpsc::UnboundedSender<I>)
    where
        I: From<T> + Send + 'static,
    {
        self.edges
            .push(Box::new(move |msg: T| inbox.send(I::from(msg)).is_ok()));
    }

    /// Connects a fresh channel and returns its receiving end.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connect(tx);
        rx
    }

    /// Number of connected edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Delivers `msg` on every live edge and returns how many accepted it.
    ///
    /// Edges whose receiver is gone are disconnected.
    pub fn publish(&mut self, msg: T) -> usize {
        let before = self.edges.len();
        self.edges.retain(|deliver| deliver(msg.clone()));
        let delivered = self.edges.len();
        if delivered < before {
            debug!(
                port = self.port,
                dropped = before - delivered,
                "Disconnected closed edges"
            );
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::gpio::GpioAttr;
    use serde_json::json;

    #[test]
    fn test_trigger_wire_shape() {
        assert_eq!(serde_json::to_value(Trigger::START).unwrap(), json!({"trigger": true}));
        let stop: Trigger = serde_json::from_value(json!({"trigger": false})).unwrap();
        assert!(!stop.is_start());
        assert!(serde_json::from_value::<Trigger>(json!({})).is_err());
    }

    #[test]
    fn test_beam_id_partial_and_full() {
        let tx_only: BeamId = serde_json::from_value(json!({"tx": 33})).unwrap();
        assert_eq!(tx_only.tx().map(BeamIndex::get), Some(33));
        assert_eq!(tx_only.rx(), None);
        assert_eq!(serde_json::to_value(tx_only).unwrap(), json!({"tx": 33}));

        let pair = BeamPair::from_raw(4, 5).unwrap();
        let full = BeamId::pair(pair);
        assert_eq!(full.as_pair(), Some(pair));
        assert_eq!(serde_json::to_value(full).unwrap(), json!({"tx": 4, "rx": 5}));
    }

    #[test]
    fn test_beam_id_rejects_malformed() {
        assert!(serde_json::from_value::<BeamId>(json!({})).is_err());
        assert!(serde_json::from_value::<BeamId>(json!({"tx": 64})).is_err());
        assert!(serde_json::from_value::<BeamId>(json!({"rx": 0})).is_err());
        assert!(BeamId::new(None, None).unwrap_err().is_validation());
    }

    #[test]
    fn test_selection_and_kpi_wire_shapes() {
        let pair = BeamPair::from_raw(31, 33).unwrap();
        let sel = Selection { set_beam: pair };
        assert_eq!(
            serde_json::to_value(sel).unwrap(),
            json!({"set_beam": {"tx": 31, "rx": 33}})
        );
        let kpi = Kpi::new(pair, -42.5);
        assert_eq!(
            serde_json::to_value(kpi).unwrap(),
            json!({"val": -42.5, "tx": 31, "rx": 33})
        );
    }

    #[test]
    fn test_gpio_cmd_wire_shape() {
        let cmd = GpioCmd {
            gpio: RegisterWrite::new("FP0", GpioAttr::Out, 64, 0xC0),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"gpio": {"bank": "FP0", "attr": "OUT", "value": 64, "mask": 192}})
        );
    }

    #[derive(Debug, PartialEq)]
    enum Inbox {
        Trigger(Trigger),
    }

    impl From<Trigger> for Inbox {
        fn from(t: Trigger) -> Self {
            Inbox::Trigger(t)
        }
    }

    #[test]
    fn test_outlet_fans_out_and_drops_closed_edges() {
        let mut outlet = Outlet::new("trigger");
        let (tx, mut rx) = mpsc::unbounded_channel::<Inbox>();
        outlet.connect(tx);
        let mut direct = outlet.subscribe();
        let dropped = outlet.subscribe();
        drop(dropped);

        assert_eq!(outlet.publish(Trigger::START), 2);
        assert_eq!(outlet.edge_count(), 2);
        assert_eq!(rx.try_recv().unwrap(), Inbox::Trigger(Trigger::START));
        assert_eq!(direct.try_recv().unwrap(), Trigger::START);
    }
}
