//! Core data types for initial access.
//!
//! Value types shared by every component: validated beam indices, beam pairs,
//! the two hardware units and their roles, and the outcome of one selection.

use crate::error::{IaError, IaResult};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Beam indices and pairs
// =============================================================================

/// A hardware beam index, guaranteed to lie in `[BeamIndex::MIN, BeamIndex::MAX]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct BeamIndex(u8);

impl BeamIndex {
    /// Lowest addressable beam.
    pub const MIN: u8 = 1;
    /// Highest addressable beam.
    pub const MAX: u8 = 63;

    /// Validates a raw index.
    pub fn new(raw: i64) -> IaResult<Self> {
        if raw < i64::from(Self::MIN) || raw > i64::from(Self::MAX) {
            return Err(IaError::Validation(format!(
                "beam index {} out of range [{}, {}]",
                raw,
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Self(raw as u8))
    }

    /// Raw index value.
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for BeamIndex {
    type Error = IaError;

    fn try_from(raw: i64) -> IaResult<Self> {
        Self::new(raw)
    }
}

impl From<BeamIndex> for u8 {
    fn from(index: BeamIndex) -> u8 {
        index.0
    }
}

impl fmt::Display for BeamIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A candidate alignment of the transmit and receive beams.
///
/// Ordering is lexicographic on `(tx, rx)`, which is also the tie-break order
/// used when two pairs score the same.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BeamPair {
    /// Transmit beam.
    pub tx: BeamIndex,
    /// Receive beam.
    pub rx: BeamIndex,
}

impl BeamPair {
    /// Pairs two validated indices.
    pub const fn new(tx: BeamIndex, rx: BeamIndex) -> Self {
        Self { tx, rx }
    }

    /// Builds a pair from raw indices, validating both.
    pub fn from_raw(tx: i64, rx: i64) -> IaResult<Self> {
        Ok(Self::new(BeamIndex::new(tx)?, BeamIndex::new(rx)?))
    }
}

impl fmt::Display for BeamPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(tx {}, rx {})", self.tx, self.rx)
    }
}

/// Safe default pair applied when a sweep fails.
pub const BORESIGHT: BeamPair = BeamPair::new(BeamIndex(32), BeamIndex(32));

// =============================================================================
// Hardware units
// =============================================================================

/// One of the two physical millimeter-wave head units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MhuId {
    /// First head unit.
    Mhu1,
    /// Second head unit.
    Mhu2,
}

impl MhuId {
    /// Both units, in id order.
    pub const ALL: [MhuId; 2] = [MhuId::Mhu1, MhuId::Mhu2];

    /// Logical id used as key in the GPIO layout (`"1"` / `"2"`).
    pub const fn number(self) -> u8 {
        match self {
            MhuId::Mhu1 => 1,
            MhuId::Mhu2 => 2,
        }
    }
}

impl fmt::Display for MhuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MHU{}", self.number())
    }
}

/// Role a unit plays in the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MhuRole {
    /// Transmitting; mode line high.
    Tx,
    /// Receiving.
    Rx,
    /// Not steered.
    Disabled,
}

impl MhuRole {
    /// Level driven on the unit's mode-select line.
    pub const fn mode_bit(self) -> u32 {
        match self {
            MhuRole::Tx => 1,
            MhuRole::Rx | MhuRole::Disabled => 0,
        }
    }
}

/// A unit selection as written in configuration: a concrete unit or "off".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitSelector {
    /// A concrete unit.
    Unit(MhuId),
    /// No unit.
    Disabled,
}

impl FromStr for UnitSelector {
    type Err = IaError;

    fn from_str(alias: &str) -> IaResult<Self> {
        match alias {
            "MHU1" | "mhu1" => Ok(UnitSelector::Unit(MhuId::Mhu1)),
            "MHU2" | "mhu2" => Ok(UnitSelector::Unit(MhuId::Mhu2)),
            "Disabled" | "Off" => Ok(UnitSelector::Disabled),
            other => Err(IaError::InvalidConfig(format!(
                "unknown MHU alias '{}' (expected MHU1, mhu1, MHU2, mhu2, Disabled or Off)",
                other
            ))),
        }
    }
}

/// Static TX/RX role assignment over both units, fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleAssignment {
    /// Unit holding the TX role.
    pub tx: UnitSelector,
    /// Unit holding the RX role.
    pub rx: UnitSelector,
}

impl RoleAssignment {
    /// Parses and validates a pair of role aliases.
    ///
    /// TX and RX may not name the same unit; either or both may be disabled.
    pub fn parse(tx_alias: &str, rx_alias: &str) -> IaResult<Self> {
        let tx: UnitSelector = tx_alias.parse()?;
        let rx: UnitSelector = rx_alias.parse()?;
        if let (UnitSelector::Unit(a), UnitSelector::Unit(b)) = (tx, rx) {
            if a == b {
                return Err(IaError::InvalidConfig(format!(
                    "invalid role assignment: TX {} and RX {} select the same unit",
                    tx_alias, rx_alias
                )));
            }
        }
        Ok(Self { tx, rx })
    }

    /// Role held by `unit` under this assignment.
    pub fn role_of(&self, unit: MhuId) -> MhuRole {
        if self.tx == UnitSelector::Unit(unit) {
            MhuRole::Tx
        } else if self.rx == UnitSelector::Unit(unit) {
            MhuRole::Rx
        } else {
            MhuRole::Disabled
        }
    }

    /// Unit holding `role`, if any.
    pub fn unit_for(&self, role: MhuRole) -> Option<MhuId> {
        let selector = match role {
            MhuRole::Tx => self.tx,
            MhuRole::Rx => self.rx,
            MhuRole::Disabled => return None,
        };
        match selector {
            UnitSelector::Unit(id) => Some(id),
            UnitSelector::Disabled => None,
        }
    }
}

// =============================================================================
// Measurements and selection
// =============================================================================

/// One KPI reading attributed to a beam pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KpiSample {
    /// Pair active when measured.
    pub pair: BeamPair,
    /// KPI value, dB.
    pub value: f64,
    /// Wall-clock time of the reading.
    pub timestamp: DateTime<Local>,
}

/// Terminal state of one sweep's selection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SelectionOutcome {
    /// The pair with the highest median KPI.
    Winner {
        /// Winning pair.
        pair: BeamPair,
        /// Median KPI of the winning pair.
        kpi_median: f64,
    },
    /// No pair collected a qualifying sample.
    Failed,
}

impl SelectionOutcome {
    /// Pair to apply: the winner, or boresight on failure.
    pub fn pair(&self) -> BeamPair {
        match self {
            SelectionOutcome::Winner { pair, .. } => *pair,
            SelectionOutcome::Failed => BORESIGHT,
        }
    }

    /// True for the failed outcome.
    pub fn is_failed(&self) -> bool {
        matches!(self, SelectionOutcome::Failed)
    }
}
