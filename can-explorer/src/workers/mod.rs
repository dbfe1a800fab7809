//! Isolated workers
//!
//! Each worker runs on a blocking thread with nothing but an owned request:
//! DBC text, primitive values and owned message data. It sends its result
//! back once through a oneshot channel and terminates. Part and re-decode
//! workers that fail log the error and drop the sender, so the receiver sees
//! a silent non-response; the offset resolver reports its failure.

pub mod offsets;
pub mod part;
pub mod redecode;

pub use offsets::{resolve_offsets, OffsetRequest};
pub use part::{fetch_decode_part, PartRequest, PartResult};
pub use redecode::{redecode_message, RedecodeRequest};

use crate::source::PartSource;
use crate::types::{Message, Offsets, Result};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Resolve offsets on a blocking thread
pub fn spawn_offset_worker(
    source: Arc<dyn PartSource>,
    request: OffsetRequest,
) -> oneshot::Receiver<Result<Offsets>> {
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let _ = tx.send(resolve_offsets(source.as_ref(), &request));
    });
    rx
}

/// Fetch and decode one part on a blocking thread
pub fn spawn_part_worker(
    source: Arc<dyn PartSource>,
    request: PartRequest,
) -> oneshot::Receiver<PartResult> {
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || match fetch_decode_part(source.as_ref(), &request) {
        Ok(result) => {
            let _ = tx.send(result);
        }
        Err(e) => log::warn!("Part worker for part {} failed: {}", request.part, e),
    });
    rx
}

/// Re-decode one message on a blocking thread
pub fn spawn_redecode_worker(request: RedecodeRequest) -> oneshot::Receiver<Message> {
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let key = request.message.key;
        match redecode_message(request) {
            Ok(message) => {
                let _ = tx.send(message);
            }
            Err(e) => log::warn!("Re-decode of {} failed: {}", key, e),
        }
    });
    rx
}
