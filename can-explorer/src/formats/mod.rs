//! Raw log segment formats
//!
//! Each part of a route is one segment. Parsers expose an iterator over
//! `RawFrame` objects.

pub mod segment;

// Re-export parser types
pub use segment::{SegmentFrameIterator, SegmentParser, SegmentWriter};
