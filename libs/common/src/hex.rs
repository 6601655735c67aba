//! Hex formatting for frame dumps in trace logs

use std::fmt::Write;

/// Space separated frame dump: `[0x01, 0x03]` → `"01 03"`
pub fn format_frame(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}
