//! DBC model and DBC text parser/writer

pub mod database;
pub mod dbc;

// Re-export key types for convenience
pub use database::{is_identifier, validate_signals, ByteOrder, DatabaseStats, Dbc, Frame, Signal, ValueType};
