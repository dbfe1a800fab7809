//! Core types for the CAN explorer
//!
//! This module defines the values that flow between the workers and the
//! orchestrator: raw frames read from a part, decoded entries, messages in
//! the store, and the route/window/offset descriptors that drive fetching.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::signals::{Frame, Signal};

/// Result type for explorer operations
pub type Result<T> = std::result::Result<T, ExplorerError>;

/// Errors that can occur while fetching, decoding or editing
#[derive(Debug, thiserror::Error)]
pub enum ExplorerError {
    #[error("Failed to parse DBC: {0}")]
    DbcParseError(String),

    #[error("Malformed segment in part {part}: {reason}")]
    SegmentError { part: u32, reason: String },

    #[error("Failed to decode frame 0x{address:X}: {reason}")]
    DecodeError { address: u32, reason: String },

    #[error("Invalid definition for frame 0x{address:X}: {reason}")]
    InvalidDefinition { address: u32, reason: String },

    #[error("Failed to fetch part {part} from {base}: {reason}")]
    FetchError { base: String, part: u32, reason: String },

    #[error("Could not resolve CAN offsets: {0}")]
    OffsetResolution(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Invalid window [{min_part}, {max_part}] for a route of {part_count} parts")]
    InvalidWindow { min_part: u32, max_part: u32, part_count: u32 },

    #[error("Worker terminated without a result")]
    WorkerGone,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// A recording, as returned by the route provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Base location of the recording's parts
    pub url: String,
    /// Number of parts in the recording
    #[serde(rename = "proclog")]
    pub part_count: u32,
}

/// Contiguous, inclusive range of parts being fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub min_part: u32,
    pub max_part: u32,
}

impl Window {
    pub fn new(min_part: u32, max_part: u32) -> Self {
        Self { min_part, max_part }
    }

    /// Initial window covering `span_parts` parts from the start of a route
    pub fn initial(span_parts: u32, part_count: u32) -> Result<Self> {
        if part_count == 0 {
            return Err(ExplorerError::InvalidWindow { min_part: 0, max_part: 0, part_count });
        }
        let max_part = span_parts.max(1).min(part_count) - 1;
        Ok(Self::new(0, max_part))
    }

    /// Distance between the first and last part
    pub fn span(&self) -> u32 {
        self.max_part - self.min_part
    }

    /// Window of the same span starting at `start_part`, shifted back if it
    /// would run past the end of the route
    pub fn moved_to(&self, start_part: u32, part_count: u32) -> Result<Self> {
        if part_count == 0 {
            return Err(ExplorerError::InvalidWindow {
                min_part: start_part,
                max_part: start_part,
                part_count,
            });
        }
        let span = self.span().min(part_count - 1);
        let min_part = start_part.min(part_count - 1 - span);
        Ok(Self::new(min_part, min_part + span))
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min_part, self.max_part)
    }
}

/// Where valid CAN data begins in a route
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Offsets {
    /// Index of the first part that carries CAN frames
    pub frame_offset: u32,
    /// Time of the first CAN frame, in seconds
    pub first_frame_time: f64,
}

/// Raw CAN frame read from a part's segment
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Timestamp in nanoseconds since the start of the log clock
    pub time_ns: u64,
    /// CAN bus the frame was seen on
    pub bus: u8,
    /// CAN address (11-bit or 29-bit)
    pub address: u32,
    /// Payload bytes
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Timestamp in seconds
    pub fn time(&self) -> f64 {
        self.time_ns as f64 / 1_000_000_000.0
    }
}

/// Store key of a decoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub bus: u8,
    pub address: u32,
}

impl MessageKey {
    pub fn new(bus: u8, address: u32) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:x}", self.bus, self.address)
    }
}

/// Decoded signal values of one entry, keyed by signal name
pub type DecodedValues = BTreeMap<String, f64>;

/// One occurrence of a message in the recording
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Seconds since the first CAN frame of the route
    pub relative_time: f64,
    /// Raw payload
    pub data: Vec<u8>,
    /// Physical values per signal
    pub values: DecodedValues,
}

/// Decoded entries of one message for a single part
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePartial {
    pub key: MessageKey,
    /// Signals the worker decoded against
    pub signals: Vec<Signal>,
    pub entries: Vec<Entry>,
    /// Frames that did not decode against `signals` (no values)
    pub undecoded: Vec<Entry>,
}

/// A message in the store
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub key: MessageKey,
    /// Frame definition from the live DBC (None if the address is unknown)
    pub frame: Option<Frame>,
    /// Signals the entries are decoded against
    pub signals: Vec<Signal>,
    /// Signal-set version of `signals` in the DBC
    pub signal_version: u64,
    /// Entries in recording order
    pub entries: Arc<Vec<Entry>>,
    /// Frames whose payload does not decode against `signals`
    ///
    /// Not shown as entries. Kept so a later signal set that fits them
    /// brings them back.
    pub undecoded: Arc<Vec<Entry>>,
}

impl Message {
    pub fn address(&self) -> u32 {
        self.key.address
    }

    /// Display name: frame name if known, otherwise the key
    pub fn name(&self) -> String {
        match &self.frame {
            Some(frame) => frame.name.clone(),
            None => self.key.to_string(),
        }
    }

    /// Index of the first entry at or after `time`
    pub fn entry_index_at(&self, time: f64) -> Option<usize> {
        self.entries.iter().position(|e| e.relative_time >= time)
    }
}
