//! Message store
//!
//! The running set of decoded messages for one generation. Parts are merged
//! by appending; a part index is merged at most once per generation.

use crate::message_decoder::MessageDecoder;
use crate::signals::{Dbc, Signal};
use crate::types::{Entry, Message, MessageKey, MessagePartial};
use crate::workers::PartResult;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Decoded messages of the current generation
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: BTreeMap<MessageKey, Message>,
    merged_parts: BTreeSet<u32>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every message and merged-part record
    pub fn reset(&mut self) {
        self.messages.clear();
        self.merged_parts.clear();
    }

    /// Merge one part's decoded messages
    ///
    /// New keys take their frame and signals from the live DBC. Existing keys
    /// get the part's entries appended. Entries the worker decoded against a
    /// different signal-set version than the message's are re-decoded
    /// against the message's signals first. Returns false if the part was
    /// already merged.
    pub fn merge_part(&mut self, result: PartResult, dbc: &Dbc) -> bool {
        if !self.merged_parts.insert(result.part) {
            log::debug!("Part {} already merged, ignoring repeat", result.part);
            return false;
        }

        let mut appended = 0usize;
        for (key, partial) in result.messages {
            let address = key.address;
            let worker_version = result.signal_versions.get(&address).copied().unwrap_or(0);

            match self.messages.get_mut(&key) {
                Some(message) => {
                    let (entries, undecoded) = Self::align(
                        address,
                        &message.signals,
                        message.signal_version,
                        worker_version,
                        partial,
                    );
                    appended += entries.len();
                    Arc::make_mut(&mut message.entries).extend(entries);
                    Arc::make_mut(&mut message.undecoded).extend(undecoded);
                }
                None => {
                    let signals = dbc.get_signals(address);
                    let version = dbc.signal_version(address);
                    let (entries, undecoded) = Self::align(address, &signals, version, worker_version, partial);
                    appended += entries.len();
                    self.messages.insert(
                        key,
                        Message {
                            key,
                            frame: dbc.frame(address).cloned(),
                            signals,
                            signal_version: version,
                            entries: Arc::new(entries),
                            undecoded: Arc::new(undecoded),
                        },
                    );
                }
            }
        }

        log::debug!(
            "Merged part {}: {} entries, {} messages in store",
            result.part,
            appended,
            self.messages.len()
        );
        true
    }

    /// Re-decode a part's frames when they were decoded against another version
    fn align(
        address: u32,
        signals: &[Signal],
        target_version: u64,
        decoded_version: u64,
        partial: MessagePartial,
    ) -> (Vec<Entry>, Vec<Entry>) {
        if target_version == decoded_version {
            return (partial.entries, partial.undecoded);
        }
        log::debug!(
            "0x{:X}: re-decoding {} frames from signal version {} to {}",
            address,
            partial.entries.len() + partial.undecoded.len(),
            decoded_version,
            target_version
        );
        MessageDecoder::redecode_entries(address, signals, &partial.entries, &partial.undecoded)
    }

    /// Install a re-decoded message
    ///
    /// `covered` is the number of entries and undecoded frames the re-decode
    /// request held; anything merged after it was issued is re-decoded here
    /// and kept as the tail.
    pub fn apply_redecoded(&mut self, mut redecoded: Message, covered: (usize, usize), signal_version: u64) -> bool {
        let Some(current) = self.messages.get(&redecoded.key) else {
            return false;
        };

        let late_entries = current.entries.get(covered.0..).unwrap_or_default();
        let late_undecoded = current.undecoded.get(covered.1..).unwrap_or_default();
        if !late_entries.is_empty() || !late_undecoded.is_empty() {
            let (tail, undecoded_tail) = MessageDecoder::redecode_entries(
                redecoded.key.address,
                &redecoded.signals,
                late_entries,
                late_undecoded,
            );
            Arc::make_mut(&mut redecoded.entries).extend(tail);
            Arc::make_mut(&mut redecoded.undecoded).extend(undecoded_tail);
        }

        redecoded.signal_version = signal_version;
        self.messages.insert(redecoded.key, redecoded);
        true
    }

    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        self.messages.get(key)
    }

    pub fn get_mut(&mut self, key: &MessageKey) -> Option<&mut Message> {
        self.messages.get_mut(key)
    }

    /// Keys of every message decoded from `address`, on any bus
    pub fn keys_for_address(&self, address: u32) -> Vec<MessageKey> {
        self.messages.keys().filter(|k| k.address == address).copied().collect()
    }

    pub fn messages(&self) -> &BTreeMap<MessageKey, Message> {
        &self.messages
    }

    pub fn is_merged(&self, part: u32) -> bool {
        self.merged_parts.contains(&part)
    }

    pub fn merged_parts(&self) -> &BTreeSet<u32> {
        &self.merged_parts
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
