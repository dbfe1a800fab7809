//! DBC text parser and writer
//!
//! Parses Vector DBC text with the `can-dbc` crate into the in-memory model,
//! and writes the model back out as canonical DBC text. Workers receive the
//! text form, never a live `Dbc`.

use crate::signals::database::{ByteOrder, Dbc, Frame, Signal, ValueType};
use crate::types::{ExplorerError, Result};
use std::collections::BTreeSet;
use std::fmt::Write;
use std::path::Path;

/// Flag set on extended (29-bit) ids in DBC `BO_` lines
const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Placeholder node name used when a frame or signal has no ECU
const NO_NODE: &str = "Vector__XXX";

impl Dbc {
    /// Parse DBC text
    pub fn parse(text: &str) -> Result<Dbc> {
        let dbc = can_dbc::DBC::from_slice(text.as_bytes())
            .map_err(|e| ExplorerError::DbcParseError(format!("{:?}", e)))?;

        let frames = dbc.messages().iter().map(convert_message).collect::<Vec<_>>();

        log::debug!("Parsed {} frames from DBC text", frames.len());
        Dbc::from_frames(frames)
    }

    /// Load a DBC file from disk
    pub fn from_file(path: &Path) -> Result<Dbc> {
        log::info!("Parsing DBC file: {:?}", path);

        let bytes = std::fs::read(path)?;

        // Try UTF-8 first, then fallback to Latin-1/Windows-1252 encoding
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
                e.into_bytes().iter().map(|&b| b as char).collect()
            }
        };

        let dbc = Self::parse(&text).map_err(|e| {
            ExplorerError::DbcParseError(format!("{:?}: {}", path, e))
        })?;

        log::info!("Parsed {} frames from {:?}", dbc.stats().num_frames, path);
        Ok(dbc)
    }

    /// Canonical DBC text for this database
    ///
    /// Names are written as they are; the model only holds definitions that
    /// parse back unchanged.
    pub fn to_dbc_text(&self) -> String {
        let mut nodes = BTreeSet::new();
        for frame in self.frames().values() {
            nodes.extend(frame.transmitter.iter().cloned());
            for signal in &frame.signals {
                nodes.extend(signal.receivers.iter().cloned());
            }
        }

        let mut out = String::new();
        out.push_str("VERSION \"\"\n\n\nNS_ :\n\nBS_:\n\n");
        if nodes.is_empty() {
            out.push_str("BU_: XXX\n");
        } else {
            let names: Vec<&str> = nodes.iter().map(String::as_str).collect();
            let _ = writeln!(out, "BU_: {}", names.join(" "));
        }

        for frame in self.frames().values() {
            write_frame(&mut out, frame);
        }

        out
    }
}

fn write_frame(out: &mut String, frame: &Frame) {
    let id = if frame.address > 0x7FF {
        frame.address | EXTENDED_ID_FLAG
    } else {
        frame.address
    };
    let transmitter = frame.transmitter.as_deref().unwrap_or(NO_NODE);

    let _ = writeln!(out, "\nBO_ {} {}: {} {}", id, frame.name, frame.size, transmitter);

    for signal in &frame.signals {
        let byte_order = match signal.byte_order {
            ByteOrder::LittleEndian => '1',
            ByteOrder::BigEndian => '0',
        };
        let sign = match signal.value_type {
            ValueType::Unsigned => '+',
            ValueType::Signed => '-',
        };
        let unit = signal.unit.as_deref().unwrap_or("");
        let receivers = if signal.receivers.is_empty() {
            NO_NODE.to_string()
        } else {
            signal.receivers.join(",")
        };

        let _ = writeln!(
            out,
            " SG_ {} : {}|{}@{}{} ({},{}) [{}|{}] \"{}\" {}",
            signal.name,
            signal.start_bit,
            signal.length,
            byte_order,
            sign,
            signal.factor,
            signal.offset,
            signal.min,
            signal.max,
            unit,
            receivers,
        );
    }
}

/// Convert a can-dbc message to our Frame
fn convert_message(dbc_msg: &can_dbc::Message) -> Frame {
    Frame {
        address: dbc_msg.message_id().0 & !EXTENDED_ID_FLAG,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        transmitter: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals: dbc_msg.signals().iter().map(convert_signal).collect(),
    }
}

/// Convert a can-dbc signal to our Signal
fn convert_signal(dbc_sig: &can_dbc::Signal) -> Signal {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    Signal {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        receivers: dbc_sig
            .receivers()
            .iter()
            .filter(|r| r.as_str() != NO_NODE)
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    const ENGINE_DBC: &str = r#"
VERSION ""

NS_ :
    NS_DESC_
    CM_
    BA_DEF_
    BA_
    VAL_

BS_:

BU_: ECU1 ECU2

BO_ 291 EngineData: 8 ECU1
 SG_ EngineSpeed : 0|16@1+ (1,0) [0|8000] "rpm" ECU2
 SG_ EngineTemp : 16|8@1+ (1,-40) [-40|215] "C" ECU2

BO_ 512 BatteryStatus: 8 ECU1
 SG_ BatteryVoltage : 0|16@1+ (0.01,0) [0|16] "V" ECU2
 SG_ BatteryCurrent : 23|16@0- (0.1,0) [-3276.8|3276.7] "A" ECU2
"#;

    #[test]
    fn test_parse_simple_dbc() {
        let dbc = Dbc::parse(ENGINE_DBC).unwrap();
        assert_eq!(dbc.stats().num_frames, 2);

        let frame = dbc.frame(291).unwrap();
        assert_eq!(frame.name, "EngineData");
        assert_eq!(frame.size, 8);
        assert_eq!(frame.transmitter, Some("ECU1".to_string()));
        assert_eq!(frame.signals.len(), 2);

        let sig = &frame.signals[1];
        assert_eq!(sig.name, "EngineTemp");
        assert_eq!(sig.start_bit, 16);
        assert_eq!(sig.length, 8);
        assert_eq!(sig.offset, -40.0);
        assert_eq!(sig.unit, Some("C".to_string()));
        assert_eq!(sig.receivers, vec!["ECU2".to_string()]);

        let current = &dbc.frame(512).unwrap().signals[1];
        assert_eq!(current.byte_order, ByteOrder::BigEndian);
        assert_eq!(current.value_type, ValueType::Signed);
    }

    #[test]
    fn test_round_trip_preserves_signals() {
        let dbc = Dbc::parse(ENGINE_DBC).unwrap();
        let reparsed = Dbc::parse(&dbc.to_dbc_text()).unwrap();
        assert_eq!(reparsed.frames(), dbc.frames());
    }

    #[test]
    fn test_round_trip_of_edited_model() {
        let mut dbc = Dbc::new();
        dbc.set_signals(
            0x201,
            vec![
                Signal::new("Counter", 0, 4),
                Signal::new("Torque", 15, 12)
                    .with_byte_order(ByteOrder::BigEndian)
                    .with_value_type(ValueType::Signed)
                    .with_scaling(0.25, -10.5)
                    .with_range(-500.0, 500.0)
                    .with_unit("Nm"),
            ],
        )
        .unwrap();
        dbc.set_signals(0x18DAF110, vec![Signal::new("Status", 0, 8)]).unwrap();

        let text = dbc.to_dbc_text();
        assert!(text.contains("BO_ 2564485392 MSG_18DAF110: 8 Vector__XXX"));

        let reparsed = Dbc::parse(&text).unwrap();
        assert_eq!(reparsed.frames(), dbc.frames());
    }

    #[test]
    fn test_written_names_match_decoded_value_keys() {
        let mut dbc = Dbc::new();
        let signals = vec![
            Signal::new("Wheel_Speed", 0, 16).with_unit("km/h"),
            Signal::new("_1st_Gear", 16, 1),
        ];
        dbc.set_signals(0x201, signals.clone()).unwrap();
        assert!(dbc.set_signals(0x201, vec![Signal::new("Wheel Speed", 0, 16)]).is_err());

        // A worker decodes against the parsed text; its value keys must be
        // the names the live model holds
        let reparsed = Dbc::parse(&dbc.to_dbc_text()).unwrap();
        assert_eq!(reparsed.get_signals(0x201), signals);
        let values = crate::MessageDecoder::decode(0x201, &reparsed.get_signals(0x201), &[0x10, 0x27, 1]).unwrap();
        let keys: Vec<&str> = values.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["Wheel_Speed", "_1st_Gear"]);
    }

    #[test]
    fn test_parse_rejects_duplicate_signal_names() {
        let text = "VERSION \"\"\n\nNS_ :\n\nBS_:\n\nBU_: ECU\n\nBO_ 1 Twice: 8 ECU\n SG_ A : 0|8@1+ (1,0) [0|0] \"\" Vector__XXX\n SG_ A : 8|8@1+ (1,0) [0|0] \"\" Vector__XXX\n";
        assert!(matches!(Dbc::parse(text), Err(ExplorerError::InvalidDefinition { address: 1, .. })));
    }

    #[test]
    fn test_parse_invalid_dbc() {
        assert!(Dbc::parse("BO_ nonsense").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(ENGINE_DBC.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let dbc = Dbc::from_file(temp_file.path()).unwrap();
        assert_eq!(dbc.stats().num_signals, 4);
    }
}
