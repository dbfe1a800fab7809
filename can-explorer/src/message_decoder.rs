//! Message Decoding Engine
//!
//! Extracts signal values from raw CAN payloads based on frame definitions
//! from the DBC. Handles bit extraction, endianness, sign extension and
//! physical value conversion. Decoding is pure: the same definition and
//! payload always produce the same values.

use crate::signals::{ByteOrder, Signal, ValueType};
use crate::types::{DecodedValues, Entry, ExplorerError, Result};

/// Message decoder - extracts signals from CAN payloads
pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode every signal of a frame
    ///
    /// # Arguments
    /// * `address` - CAN address, used for error reporting
    /// * `signals` - Signal set to decode against
    /// * `data` - Raw payload
    ///
    /// # Returns
    /// * `Ok(values)` with one physical value per signal
    /// * `Err(DecodeError)` if any signal does not fit in the payload
    pub fn decode(address: u32, signals: &[Signal], data: &[u8]) -> Result<DecodedValues> {
        let mut values = DecodedValues::new();

        for signal in signals {
            let raw = Self::extract_signal_value(data, signal).ok_or_else(|| {
                ExplorerError::DecodeError {
                    address,
                    reason: format!(
                        "signal '{}' ({}|{}) does not fit in {} bytes",
                        signal.name,
                        signal.start_bit,
                        signal.length,
                        data.len()
                    ),
                }
            })?;
            values.insert(signal.name.clone(), signal.offset + signal.factor * raw as f64);
        }

        Ok(values)
    }

    /// Re-decode a message's entries and undecoded frames against a signal set
    ///
    /// Both inputs are in time order and are merged by time first. Times and
    /// raw bytes are kept. Returns `(entries, undecoded)`: a frame whose
    /// payload does not fit the signal set is not an entry and keeps no
    /// values, so the result depends only on the frames and the signals.
    pub fn redecode_entries(
        address: u32,
        signals: &[Signal],
        entries: &[Entry],
        undecoded: &[Entry],
    ) -> (Vec<Entry>, Vec<Entry>) {
        let mut decoded = Vec::with_capacity(entries.len());
        let mut failed = Vec::new();

        for entry in merge_by_time(entries, undecoded) {
            match Self::decode(address, signals, &entry.data) {
                Ok(values) => decoded.push(Entry {
                    relative_time: entry.relative_time,
                    data: entry.data.clone(),
                    values,
                }),
                Err(e) => {
                    log::trace!("{}", e);
                    failed.push(Entry {
                        relative_time: entry.relative_time,
                        data: entry.data.clone(),
                        values: DecodedValues::new(),
                    });
                }
            }
        }
        (decoded, failed)
    }

    /// Extract raw signal value from CAN frame data
    ///
    /// Returns None if the signal has zero length, is wider than 64 bits, or
    /// reaches past the end of the payload.
    fn extract_signal_value(data: &[u8], signal: &Signal) -> Option<i64> {
        let start_bit = signal.start_bit as usize;
        let length = signal.length as usize;

        if length == 0 || length > 64 {
            return None;
        }

        let raw_value = match signal.byte_order {
            ByteOrder::LittleEndian => Self::extract_little_endian(data, start_bit, length)?,
            ByteOrder::BigEndian => Self::extract_big_endian(data, start_bit, length)?,
        };

        let value = match signal.value_type {
            ValueType::Unsigned => raw_value as i64,
            ValueType::Signed => Self::sign_extend(raw_value, length),
        };

        Some(value)
    }

    /// Extract signal with little-endian (Intel) byte order
    ///
    /// The start bit is the LSB; bits are numbered LSB-first within each byte
    /// and the signal grows towards higher byte indices.
    fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
        if start_bit + length > data.len() * 8 {
            return None;
        }

        let mut result: u64 = 0;
        for i in 0..length {
            let bit_pos = start_bit + i;
            let bit_value = (data[bit_pos / 8] >> (bit_pos % 8)) & 0x01;
            result |= (bit_value as u64) << i;
        }

        Some(result)
    }

    /// Extract signal with big-endian (Motorola) byte order
    ///
    /// The start bit is the MSB in DBC sawtooth numbering: within a byte the
    /// walk goes from bit 7 down to bit 0, then continues at bit 7 of the
    /// next byte.
    fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
        let mut result: u64 = 0;
        let mut bit_pos = start_bit;

        for i in 0..length {
            let byte_idx = bit_pos / 8;
            if byte_idx >= data.len() {
                return None;
            }
            let bit_value = (data[byte_idx] >> (bit_pos % 8)) & 0x01;
            result = (result << 1) | bit_value as u64;

            if i + 1 < length {
                bit_pos = if bit_pos % 8 == 0 { bit_pos + 15 } else { bit_pos - 1 };
            }
        }

        Some(result)
    }

    /// Sign-extend a value from N bits to 64 bits
    fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }
}

/// Merge two time-ordered entry lists; on equal times `a` goes first
fn merge_by_time<'a>(a: &'a [Entry], b: &'a [Entry]) -> Vec<&'a Entry> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if b[j].relative_time < a[i].relative_time {
            merged.push(&b[j]);
            j += 1;
        } else {
            merged.push(&a[i]);
            i += 1;
        }
    }
    merged.extend(&a[i..]);
    merged.extend(&b[j..]);
    merged
}
