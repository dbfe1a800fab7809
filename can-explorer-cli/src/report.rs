//! Text summary of a store snapshot

use can_explorer::{Message, StoreView};
use std::fmt::Write;

/// Render the loaded window and one line per message
pub fn summary(view: &StoreView) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Window:   {} of {} parts", view.window, view.part_count);
    let _ = writeln!(out, "State:    {}", view.chain);
    let _ = writeln!(out, "DBC:      {}", view.dbc_filename);
    if let Some(saved) = view.dbc_last_saved {
        let _ = writeln!(out, "Saved:    {}", saved.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(offsets) = view.offsets {
        let _ = writeln!(
            out,
            "Offsets:  part {}, first frame at {:.3} s",
            offsets.frame_offset, offsets.first_frame_time
        );
    }
    let _ = writeln!(out, "Messages: {} ({} entries)", view.messages.len(), view.entry_count());
    let _ = writeln!(out);

    for message in view.messages.values() {
        let _ = writeln!(out, "{}", message_line(message));
    }
    out
}

fn message_line(message: &Message) -> String {
    let span = match (message.entries.first(), message.entries.last()) {
        (Some(first), Some(last)) => format!("{:>9.3} .. {:<9.3}", first.relative_time, last.relative_time),
        _ => format!("{:^22}", "-"),
    };

    let last_values = message
        .entries
        .last()
        .map(|entry| {
            entry
                .values
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    let mut line = format!(
        "  {:<10} {:<24} {:>6} entries  {}  {}",
        message.key.to_string(),
        message.name(),
        message.entries.len(),
        span,
        last_values
    );
    if !message.undecoded.is_empty() {
        let _ = write!(line, "  ({} frames do not decode)", message.undecoded.len());
    }
    line
}
