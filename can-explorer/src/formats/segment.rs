//! Part segment parser
//!
//! A part's raw data is a flat sequence of little-endian records:
//!
//! | Field     | Type | Notes                                   |
//! |-----------|------|-----------------------------------------|
//! | `kind`    | u8   | 0 = CAN frame, anything else is skipped |
//! | `time_ns` | u64  | log clock                               |
//!
//! followed, for CAN records, by `address: u32, bus: u8, len: u8,
//! data[len]`, and for every other kind by `len: u16, payload[len]`.
//!
//! A record cut short by the end of the buffer ends the segment; frames
//! parsed before it are kept.

use crate::types::{ExplorerError, RawFrame, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashSet;
use std::io::{self, Cursor, Read};

/// Record kind for CAN frames
pub const RECORD_CAN: u8 = 0;

/// Segment parser over one part's bytes
pub struct SegmentParser;

impl SegmentParser {
    /// Parse a part's raw bytes into an iterator over CAN frames
    pub fn parse(part: u32, bytes: &[u8]) -> SegmentFrameIterator<'_> {
        log::trace!("Parsing segment of part {} ({} bytes)", part, bytes.len());
        SegmentFrameIterator {
            part,
            cursor: Cursor::new(bytes),
            skipped_kinds: HashSet::new(),
            done: false,
        }
    }

    /// Parse every frame of a part, stopping at the first malformed record
    pub fn frames(part: u32, bytes: &[u8]) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        for frame in Self::parse(part, bytes) {
            match frame {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    log::warn!("{}; keeping {} frames read so far", e, frames.len());
                    break;
                }
            }
        }
        frames
    }
}

/// Iterator over CAN frames in a segment
pub struct SegmentFrameIterator<'a> {
    part: u32,
    cursor: Cursor<&'a [u8]>,
    skipped_kinds: HashSet<u8>,
    done: bool,
}

impl SegmentFrameIterator<'_> {
    fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }

    fn truncated(&mut self, e: io::Error) -> ExplorerError {
        self.done = true;
        ExplorerError::SegmentError {
            part: self.part,
            reason: format!("truncated record at byte {}: {}", self.cursor.position(), e),
        }
    }

    fn read_record(&mut self) -> io::Result<Option<RawFrame>> {
        let kind = self.cursor.read_u8()?;
        let time_ns = self.cursor.read_u64::<LittleEndian>()?;

        if kind == RECORD_CAN {
            let address = self.cursor.read_u32::<LittleEndian>()?;
            let bus = self.cursor.read_u8()?;
            let len = self.cursor.read_u8()? as usize;
            let mut data = vec![0u8; len];
            self.cursor.read_exact(&mut data)?;
            Ok(Some(RawFrame { time_ns, bus, address, data }))
        } else {
            let len = self.cursor.read_u16::<LittleEndian>()? as usize;
            let mut payload = vec![0u8; len];
            self.cursor.read_exact(&mut payload)?;
            if self.skipped_kinds.insert(kind) {
                log::debug!("Skipping non-CAN records of kind {} in part {}", kind, self.part);
            }
            Ok(None)
        }
    }
}

impl Iterator for SegmentFrameIterator<'_> {
    type Item = Result<RawFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.remaining() == 0 {
                return None;
            }
            match self.read_record() {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => continue,
                Err(e) => return Some(Err(self.truncated(e))),
            }
        }
    }
}

/// Writes segment records; used to build parts for tests and demo routes
#[derive(Debug, Default)]
pub struct SegmentWriter {
    buf: Vec<u8>,
}

impl SegmentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a CAN frame record
    pub fn frame(mut self, time_ns: u64, bus: u8, address: u32, data: &[u8]) -> Self {
        // Vec<u8> writes are infallible
        let _ = self.buf.write_u8(RECORD_CAN);
        let _ = self.buf.write_u64::<LittleEndian>(time_ns);
        let _ = self.buf.write_u32::<LittleEndian>(address);
        let _ = self.buf.write_u8(bus);
        let _ = self.buf.write_u8(data.len().min(u8::MAX as usize) as u8);
        self.buf.extend_from_slice(&data[..data.len().min(u8::MAX as usize)]);
        self
    }

    /// Append a non-CAN record of `kind`
    pub fn other(mut self, kind: u8, time_ns: u64, payload: &[u8]) -> Self {
        let len = payload.len().min(u16::MAX as usize);
        let _ = self.buf.write_u8(kind);
        let _ = self.buf.write_u64::<LittleEndian>(time_ns);
        let _ = self.buf.write_u16::<LittleEndian>(len as u16);
        self.buf.extend_from_slice(&payload[..len]);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
