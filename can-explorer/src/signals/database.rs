//! In-memory DBC model
//!
//! Holds frame definitions keyed by CAN address. Edits replace the signal set
//! of one frame at a time and bump that frame's signal-set version, so work
//! decoded against an older set can be detected.
//!
//! Every definition that enters the model must survive a write to DBC text
//! and a parse back unchanged: names are DBC identifiers, signal names are
//! unique within a frame, and units hold no `"`.

use crate::types::{ExplorerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Decoding definition for one CAN address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// CAN address (without the DBC extended-id flag)
    pub address: u32,
    /// Frame name
    pub name: String,
    /// Payload size in bytes
    pub size: usize,
    /// Sending ECU (None for `Vector__XXX`)
    pub transmitter: Option<String>,
    /// Signals in definition order
    pub signals: Vec<Signal>,
}

/// A bit-packed field within a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Signal name
    pub name: String,
    /// Start bit in the CAN frame (DBC numbering)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Receiving ECUs
    #[serde(default)]
    pub receivers: Vec<String>,
}

impl Signal {
    /// Unsigned little-endian signal with unit scaling and no bounds
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
            receivers: Vec::new(),
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Check the signal can be written as DBC text and read back unchanged
    pub fn validate(&self, address: u32) -> Result<()> {
        check_identifier(address, "signal", &self.name)?;
        if self.unit.as_deref().is_some_and(|unit| unit.contains('"')) {
            return Err(invalid(address, format!("unit of signal '{}' contains '\"'", self.name)));
        }
        for receiver in &self.receivers {
            check_identifier(address, "receiver", receiver)?;
        }
        Ok(())
    }
}

impl Frame {
    /// Check the frame and all of its signals
    pub fn validate(&self) -> Result<()> {
        check_identifier(self.address, "frame", &self.name)?;
        if let Some(transmitter) = &self.transmitter {
            check_identifier(self.address, "transmitter", transmitter)?;
        }
        validate_signals(self.address, &self.signals)
    }
}

/// Check a signal set for one address: every signal valid, names unique
pub fn validate_signals(address: u32, signals: &[Signal]) -> Result<()> {
    let mut names = HashSet::new();
    for signal in signals {
        signal.validate(address)?;
        if !names.insert(signal.name.as_str()) {
            return Err(invalid(address, format!("duplicate signal name '{}'", signal.name)));
        }
    }
    Ok(())
}

/// DBC identifier: ASCII letters, digits and `_`, not starting with a digit
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn check_identifier(address: u32, what: &str, name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(invalid(address, format!("{} name '{}' is not a DBC identifier", what, name)))
    }
}

fn invalid(address: u32, reason: String) -> ExplorerError {
    ExplorerError::InvalidDefinition { address, reason }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// The DBC: frame definitions by address, plus a signal-set version per frame
#[derive(Debug, Clone, Default)]
pub struct Dbc {
    frames: BTreeMap<u32, Frame>,
    signal_versions: BTreeMap<u32, u64>,
}

impl Dbc {
    /// Create an empty DBC
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a DBC from frame definitions (later duplicates win)
    pub fn from_frames(frames: impl IntoIterator<Item = Frame>) -> Result<Self> {
        let mut dbc = Self::new();
        for frame in frames {
            dbc.add_frame(frame)?;
        }
        Ok(dbc)
    }

    /// Insert or replace a whole frame definition
    pub fn add_frame(&mut self, frame: Frame) -> Result<()> {
        frame.validate()?;
        self.bump_version(frame.address);
        self.frames.insert(frame.address, frame);
        Ok(())
    }

    /// Signals of a frame, empty if the address is unknown
    pub fn get_signals(&self, address: u32) -> Vec<Signal> {
        self.frames
            .get(&address)
            .map(|frame| frame.signals.clone())
            .unwrap_or_default()
    }

    /// Replace the signal set of a frame, creating the frame if absent
    ///
    /// A rejected set leaves the frame and its version untouched.
    pub fn set_signals(&mut self, address: u32, signals: Vec<Signal>) -> Result<()> {
        validate_signals(address, &signals)?;
        log::debug!("Replacing signals of 0x{:X} ({} signals)", address, signals.len());
        self.frames
            .entry(address)
            .or_insert_with(|| Self::default_frame(address))
            .signals = signals;
        self.bump_version(address);
        Ok(())
    }

    /// Default empty frame for an address seen on the bus but absent here
    ///
    /// The frame is not inserted; callers decide whether to keep it.
    pub fn create_frame(&self, address: u32) -> Frame {
        Self::default_frame(address)
    }

    fn default_frame(address: u32) -> Frame {
        Frame {
            address,
            name: format!("MSG_{:X}", address),
            size: 8,
            transmitter: None,
            signals: Vec::new(),
        }
    }

    fn bump_version(&mut self, address: u32) {
        *self.signal_versions.entry(address).or_insert(0) += 1;
    }

    /// Frame definition for an address
    pub fn frame(&self, address: u32) -> Option<&Frame> {
        self.frames.get(&address)
    }

    /// All frame definitions by address
    pub fn frames(&self) -> &BTreeMap<u32, Frame> {
        &self.frames
    }

    /// Current signal-set version of a frame (0 if it was never defined)
    pub fn signal_version(&self, address: u32) -> u64 {
        self.signal_versions.get(&address).copied().unwrap_or(0)
    }

    /// Signal-set versions of every known frame
    pub fn signal_versions(&self) -> BTreeMap<u32, u64> {
        self.signal_versions.clone()
    }

    /// All known addresses, ascending
    pub fn addresses(&self) -> Vec<u32> {
        self.frames.keys().copied().collect()
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_frames: self.frames.len(),
            num_signals: self.frames.values().map(|f| f.signals.len()).sum(),
        }
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Number of frame definitions
    pub num_frames: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}
