//! Part fetch-decode worker
//!
//! Retrieves one part's segment, parses it into raw frames and decodes each
//! frame against a DBC parsed locally from the request's text snapshot.

use crate::formats::SegmentParser;
use crate::message_decoder::MessageDecoder;
use crate::signals::Dbc;
use crate::source::PartSource;
use crate::types::{DecodedValues, Entry, MessageKey, MessagePartial, Result};
use std::collections::BTreeMap;

/// Part worker input
#[derive(Debug, Clone)]
pub struct PartRequest {
    /// DBC text snapshot taken when the request was built
    pub dbc_text: String,
    /// Route base location
    pub base: String,
    /// Part index
    pub part: u32,
    /// Time of the route's first CAN frame, in seconds
    pub start_time: f64,
    /// Signal-set versions matching `dbc_text`, echoed back in the result
    pub signal_versions: BTreeMap<u32, u64>,
}

/// Decoded messages of one part
#[derive(Debug, Clone, PartialEq)]
pub struct PartResult {
    pub part: u32,
    /// Signal-set versions the part was decoded against
    pub signal_versions: BTreeMap<u32, u64>,
    pub messages: BTreeMap<MessageKey, MessagePartial>,
}

impl PartResult {
    /// Total number of decoded entries
    pub fn entry_count(&self) -> usize {
        self.messages.values().map(|m| m.entries.len()).sum()
    }
}

/// Fetch and decode one part
///
/// Frames whose payload does not fit their signal definitions are omitted
/// from the entries and returned as undecoded frames; the rest of the part
/// still decodes. Frames with no definition in the DBC produce entries
/// without values.
pub fn fetch_decode_part(source: &dyn PartSource, request: &PartRequest) -> Result<PartResult> {
    let dbc = Dbc::parse(&request.dbc_text)?;
    let bytes = source.fetch(&request.base, request.part)?;

    let mut messages: BTreeMap<MessageKey, MessagePartial> = BTreeMap::new();
    let mut frame_count = 0usize;
    let mut omitted = 0usize;

    for frame in SegmentParser::frames(request.part, &bytes) {
        frame_count += 1;
        let key = MessageKey::new(frame.bus, frame.address);

        let message = messages.entry(key).or_insert_with(|| MessagePartial {
            key,
            signals: dbc.get_signals(frame.address),
            entries: Vec::new(),
            undecoded: Vec::new(),
        });

        let relative_time = (frame.time() - request.start_time).max(0.0);
        match MessageDecoder::decode(frame.address, &message.signals, &frame.data) {
            Ok(values) => message.entries.push(Entry {
                relative_time,
                data: frame.data,
                values,
            }),
            Err(e) => {
                log::trace!("Omitting frame in part {}: {}", request.part, e);
                omitted += 1;
                message.undecoded.push(Entry {
                    relative_time,
                    data: frame.data,
                    values: DecodedValues::new(),
                });
            }
        }
    }

    if omitted > 0 {
        log::warn!(
            "Part {}: omitted {} of {} frames that failed to decode",
            request.part,
            omitted,
            frame_count
        );
    }
    log::debug!(
        "Part {} decoded: {} frames, {} messages",
        request.part,
        frame_count,
        messages.len()
    );

    Ok(PartResult {
        part: request.part,
        signal_versions: request.signal_versions.clone(),
        messages,
    })
}
