//! Packet logging helpers

use tracing::{info, trace};

/// Render bytes as space-separated uppercase hex
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Frame direction for [`log_packet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
        }
    }
}

/// Log a raw frame
///
/// With `enabled` the frame goes out at `info` level (the packet log);
/// otherwise it is only visible at `trace`.
pub fn log_packet(enabled: bool, direction: Direction, data: &[u8], unit_id: u8) {
    if enabled {
        info!(
            "[MODBUS-TCP] {} unit:{} {}",
            direction.as_str(),
            unit_id,
            format_hex_packet(data)
        );
    } else {
        trace!(
            "[MODBUS-TCP] {} unit:{} {}",
            direction.as_str(),
            unit_id,
            format_hex_packet(data)
        );
    }
}
