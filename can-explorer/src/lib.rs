//! CAN Explorer Library
//!
//! Streams a long CAN recording in fixed-size parts, decodes each part against
//! a DBC and merges the decoded messages into a running store. Signal edits
//! re-decode only the affected message.
//!
//! # Architecture
//!
//! - Workers (`workers`) are isolated units of work: they receive an owned
//!   request (DBC text, primitive values, owned message data), run on a
//!   blocking thread and answer once through a oneshot channel.
//! - The orchestrator (`orchestrator`) is a synchronous state machine. It
//!   owns the window, the live DBC and the message store, stamps every part
//!   request with a generation and discards results from superseded
//!   generations.
//! - The driver (`driver`) runs the orchestrator as a tokio actor, supervises
//!   part fetches and publishes store snapshots.
//!
//! Presentation is left to the consumer, which subscribes to snapshots and
//! issues window changes, DBC swaps and signal edits through the handle.
//!
//! # Example Usage
//!
//! ```no_run
//! use can_explorer::{
//!     ExplorerConfig, ExplorerHandle, FsDbcStore, FsPartSource, DbcStore, Orchestrator, Route,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> can_explorer::Result<()> {
//! let config = ExplorerConfig::new();
//! let store = Arc::new(FsDbcStore::new("dbc"));
//! let (filename, dbc) = store.load("powertrain")?;
//!
//! let route = Route { url: "/data/routes/r1".to_string(), part_count: 12 };
//! let orchestrator = Orchestrator::new(route, dbc, filename, config.clone())?;
//! let source = Arc::new(FsPartSource::new(config.segment_file.clone()));
//!
//! let explorer = ExplorerHandle::spawn(orchestrator, source, store);
//! let view = explorer.wait_for(|v| v.is_settled()).await?;
//! for message in view.messages.values() {
//!     println!("{} {} entries", message.name(), message.entries.len());
//! }
//! explorer.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Public modules
pub mod config;
pub mod driver;
pub mod formats;
pub mod message_decoder;
pub mod orchestrator;
pub mod route;
pub mod signals;
pub mod source;
pub mod store;
pub mod types;
pub mod workers;

// Re-export main types for convenience
pub use config::ExplorerConfig;
pub use driver::{Command, Debouncer, ExplorerHandle};
pub use message_decoder::MessageDecoder;
pub use orchestrator::{Action, ChainState, Freshness, GenerationStamp, Orchestrator, RedecodeTicket, StoreView};
pub use route::{require_route, DbcStore, FsDbcStore, JsonRouteProvider, RouteProvider};
pub use signals::{validate_signals, ByteOrder, DatabaseStats, Dbc, Frame, Signal, ValueType};
pub use source::{FsPartSource, HttpPartSource, MemoryPartSource, PartSource};
pub use store::MessageStore;
pub use types::{
    DecodedValues, Entry, ExplorerError, Message, MessageKey, MessagePartial, Offsets, RawFrame,
    Result, Route, Window,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
