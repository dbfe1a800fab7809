//! Single-message re-decoder
//!
//! Re-decodes every frame of one message, entries and undecoded frames
//! alike, against that frame's signal set in a DBC text snapshot. Times and
//! raw bytes are untouched.

use crate::message_decoder::MessageDecoder;
use crate::signals::Dbc;
use crate::types::{Message, Result};
use std::sync::Arc;

/// Re-decode worker input
#[derive(Debug, Clone)]
pub struct RedecodeRequest {
    /// Message to re-decode, entries included
    pub message: Message,
    /// DBC text taken after the edit was written
    pub dbc_text: String,
}

/// Re-decode one message against the snapshot's signals for its address
///
/// A frame whose payload does not fit the new signal set moves to the
/// message's undecoded frames; one that fits again becomes an entry.
pub fn redecode_message(request: RedecodeRequest) -> Result<Message> {
    let dbc = Dbc::parse(&request.dbc_text)?;
    let mut message = request.message;
    let address = message.address();

    let signals = dbc.get_signals(address);
    let (entries, undecoded) =
        MessageDecoder::redecode_entries(address, &signals, &message.entries, &message.undecoded);

    if !undecoded.is_empty() {
        log::warn!(
            "{}: omitting {} of {} frames that do not decode",
            message.key,
            undecoded.len(),
            entries.len() + undecoded.len()
        );
    }

    if let Some(frame) = dbc.frame(address) {
        message.frame = Some(frame.clone());
    }
    message.signals = signals;
    message.entries = Arc::new(entries);
    message.undecoded = Arc::new(undecoded);

    Ok(message)
}
