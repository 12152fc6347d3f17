//! GPIO bit-field layout and register-write encoding.
//!
//! The beam-steering heads are driven through a front-panel GPIO bank. Three
//! disjoint bit fields are used:
//!
//! - `beam_range`: the beam index presented to both heads
//! - `id_range`: one select line per head; a head latches the beam field on
//!   the falling edge of its select line
//! - `mode_range`: one line per head, high for TX, low for RX/disabled
//!
//! The layout document looks like (JSON or TOML):
//!
//! ```json
//! {
//!   "beam_range": {"lower": 0, "upper": 5},
//!   "id_range":   {"lower": 6, "upper": 7},
//!   "mode_range": {"lower": 8, "upper": 9},
//!   "radio_id":   {"1": 6, "2": 7},
//!   "radio_mode": {"1": 8, "2": 9}
//! }
//! ```
//!
//! Encoders here are pure; timing between writes is the mapper's job.

use crate::core::{BeamIndex, MhuId, RoleAssignment};
use crate::error::{IaError, IaResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;

/// Bank every command targets.
pub const GPIO_BANK: &str = "FP0";

/// Register attribute addressed by a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GpioAttr {
    /// Direction-control enable.
    Ctrl,
    /// Data-direction register, 1 = output.
    Ddr,
    /// Output value.
    Out,
}

impl fmt::Display for GpioAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GpioAttr::Ctrl => "CTRL",
            GpioAttr::Ddr => "DDR",
            GpioAttr::Out => "OUT",
        };
        f.write_str(name)
    }
}

/// A masked register write: only bits set in `mask` are affected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWrite {
    /// GPIO bank name.
    pub bank: String,
    /// Register addressed.
    #[serde(rename = "attr")]
    pub attribute: GpioAttr,
    /// Bits to drive.
    pub value: u32,
    /// Bits affected.
    pub mask: u32,
}

impl RegisterWrite {
    /// Builds a write.
    pub fn new(bank: impl Into<String>, attribute: GpioAttr, value: u32, mask: u32) -> Self {
        Self {
            bank: bank.into(),
            attribute,
            value,
            mask,
        }
    }

    /// Applies the write to a register image.
    pub fn apply(&self, register: u32) -> u32 {
        (register & !self.mask) | (self.value & self.mask)
    }
}

/// Inclusive bit range `[lower, upper]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitRange {
    /// Lowest bit.
    pub lower: u32,
    /// Highest bit.
    pub upper: u32,
}

impl BitRange {
    /// Number of bits.
    pub fn width(&self) -> u32 {
        self.upper - self.lower + 1
    }

    /// Mask of the field, already shifted into position.
    pub fn mask(&self) -> u32 {
        let unshifted = if self.width() >= 32 {
            u32::MAX
        } else {
            (1u32 << self.width()) - 1
        };
        unshifted << self.lower
    }

    /// True if `bit` lies in the range.
    pub fn contains(&self, bit: u32) -> bool {
        bit >= self.lower && bit <= self.upper
    }

    fn overlaps(&self, other: &BitRange) -> bool {
        self.lower <= other.upper && other.lower <= self.upper
    }
}

/// Validated GPIO layout for both heads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpioLayout {
    /// Per-unit select lines.
    pub id_range: BitRange,
    /// Per-unit mode lines.
    pub mode_range: BitRange,
    /// Beam index field.
    pub beam_range: BitRange,
    radio_id: [u32; 2],
    radio_mode: [u32; 2],
}

impl GpioLayout {
    /// Builds and validates a layout.
    pub fn new(
        id_range: BitRange,
        mode_range: BitRange,
        beam_range: BitRange,
        radio_id: [u32; 2],
        radio_mode: [u32; 2],
    ) -> IaResult<Self> {
        let layout = Self {
            id_range,
            mode_range,
            beam_range,
            radio_id,
            radio_mode,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Loads a layout document; `.toml` files are read as TOML, anything
    /// else as JSON.
    pub fn load(path: impl AsRef<Path>) -> IaResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| IaError::ConfigNotFound {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path.extension().is_some_and(|ext| ext == "toml");
        let document: Value = if is_toml {
            toml::from_str(&text).map_err(|e| IaError::ConfigParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            serde_json::from_str(&text).map_err(|e| IaError::ConfigParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        };
        Self::from_document(&document)
    }

    /// Extracts a layout from an already parsed document.
    pub fn from_document(document: &Value) -> IaResult<Self> {
        let id_range = range(document, "id_range")?;
        let mode_range = range(document, "mode_range")?;
        let beam_range = range(document, "beam_range")?;
        let radio_id = [
            bit(document, "radio_id", "1")?,
            bit(document, "radio_id", "2")?,
        ];
        let radio_mode = [
            bit(document, "radio_mode", "1")?,
            bit(document, "radio_mode", "2")?,
        ];
        Self::new(id_range, mode_range, beam_range, radio_id, radio_mode)
    }

    fn validate(&self) -> IaResult<()> {
        let fields = [
            ("id_range", self.id_range),
            ("mode_range", self.mode_range),
            ("beam_range", self.beam_range),
        ];
        for (name, field) in fields {
            if field.lower > field.upper || field.upper > 31 {
                return Err(IaError::InvalidConfig(format!(
                    "{} [{}, {}] is not a valid 32-bit field",
                    name, field.lower, field.upper
                )));
            }
        }
        for (i, (a_name, a)) in fields.iter().enumerate() {
            for (b_name, b) in fields.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(IaError::InvalidConfig(format!(
                        "{} and {} overlap",
                        a_name, b_name
                    )));
                }
            }
        }
        if self.beam_range.width() < 6 {
            return Err(IaError::InvalidConfig(format!(
                "beam_range is {} bits wide, {} needs 6",
                self.beam_range.width(),
                BeamIndex::MAX
            )));
        }
        for unit in MhuId::ALL {
            let id_bit = self.id_bit(unit);
            if !self.id_range.contains(id_bit) {
                return Err(IaError::InvalidConfig(format!(
                    "radio_id for {} (bit {}) lies outside id_range",
                    unit, id_bit
                )));
            }
            let mode_bit = self.mode_bit(unit);
            if !self.mode_range.contains(mode_bit) {
                return Err(IaError::InvalidConfig(format!(
                    "radio_mode for {} (bit {}) lies outside mode_range",
                    unit, mode_bit
                )));
            }
        }
        if self.radio_id[0] == self.radio_id[1] || self.radio_mode[0] == self.radio_mode[1] {
            return Err(IaError::InvalidConfig(
                "both units share a select line".into(),
            ));
        }
        Ok(())
    }

    /// Id-select bit position of `unit`.
    pub fn id_bit(&self, unit: MhuId) -> u32 {
        self.radio_id[usize::from(unit.number() - 1)]
    }

    /// Mode-select bit position of `unit`.
    pub fn mode_bit(&self, unit: MhuId) -> u32 {
        self.radio_mode[usize::from(unit.number() - 1)]
    }

    /// Union of the three fields.
    pub fn combined_mask(&self) -> u32 {
        self.id_range.mask() | self.mode_range.mask() | self.beam_range.mask()
    }

    /// Writes that initialise the bank and burn in the role selection.
    ///
    /// Sequence: disable direction control, make every field an output,
    /// zero every field, then drive the mode lines.
    pub fn setup_sequence(&self, roles: &RoleAssignment) -> Vec<RegisterWrite> {
        let all = self.combined_mask();
        let mode_value = MhuId::ALL.iter().fold(0u32, |acc, &unit| {
            acc | (roles.role_of(unit).mode_bit() << self.mode_bit(unit))
        });
        vec![
            RegisterWrite::new(GPIO_BANK, GpioAttr::Ctrl, 0, all),
            RegisterWrite::new(GPIO_BANK, GpioAttr::Ddr, all, all),
            RegisterWrite::new(GPIO_BANK, GpioAttr::Out, 0, all),
            RegisterWrite::new(GPIO_BANK, GpioAttr::Out, mode_value, self.mode_range.mask()),
        ]
    }

    /// Writes that steer `unit` to `beam`: present the index, then pulse the
    /// unit's id-select line high and back low.
    pub fn beam_sequence(&self, unit: MhuId, beam: BeamIndex) -> [RegisterWrite; 3] {
        let beam_value = u32::from(beam.get()) << self.beam_range.lower;
        let id_mask = self.id_range.mask();
        [
            RegisterWrite::new(GPIO_BANK, GpioAttr::Out, beam_value, self.beam_range.mask()),
            RegisterWrite::new(GPIO_BANK, GpioAttr::Out, 1 << self.id_bit(unit), id_mask),
            RegisterWrite::new(GPIO_BANK, GpioAttr::Out, 0, id_mask),
        ]
    }
}

fn range(document: &Value, key: &str) -> IaResult<BitRange> {
    let section = document
        .get(key)
        .ok_or_else(|| IaError::MissingKey(key.to_string()))?;
    let lower = bound(section, key, "lower")?;
    let upper = bound(section, key, "upper")?;
    Ok(BitRange { lower, upper })
}

fn bit(document: &Value, table: &str, unit: &str) -> IaResult<u32> {
    let section = document
        .get(table)
        .ok_or_else(|| IaError::MissingKey(table.to_string()))?;
    bound(section, table, unit)
}

fn bound(section: &Value, table: &str, key: &str) -> IaResult<u32> {
    let full_key = format!("{}.{}", table, key);
    let value = section
        .get(key)
        .ok_or_else(|| IaError::MissingKey(full_key.clone()))?;
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| {
            IaError::InvalidConfig(format!("{} must be a bit position, got {}", full_key, value))
        })
}
