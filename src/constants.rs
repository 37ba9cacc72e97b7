//! Protocol limits and manager defaults
//!
//! Protocol values follow the Modbus Application Protocol and Modbus TCP
//! messaging guides. Manager defaults are what a configuration falls back to
//! when a field is omitted.

// ============================================================================
// MBAP Framing
// ============================================================================

/// Bytes preceding the length-delimited part of an MBAP frame:
/// Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Full MBAP header including the Unit ID byte
pub const MBAP_HEADER_WITH_UNIT_LEN: usize = MBAP_HEADER_LEN + 1;

/// Modbus TCP always carries protocol identifier 0
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Maximum PDU size: RS485 ADU (256) - address (1) - CRC (2)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU) = 254
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Smallest legal MBAP length field: Unit ID + function code
pub const MIN_MBAP_LENGTH: usize = 2;

/// Initial capacity of the per-connection receive buffer
///
/// One maximal frame is 6 + 254 = 260 bytes; 512 leaves room for a frame
/// arriving behind a stray one.
pub const RX_BUFFER_CAPACITY: usize = 512;

// ============================================================================
// Quantity Limits
// ============================================================================

/// Maximum registers per FC03/FC04 read
///
/// Response PDU: FC(1) + byte count(1) + N × 2 ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum registers per FC16 write
///
/// Request PDU: FC(1) + address(2) + quantity(2) + byte count(1) + N × 2 ≤ 253
/// → N ≤ 123
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Maximum bits per FC01/FC02 read
pub const MAX_READ_COILS: usize = 2000;

// ============================================================================
// Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Exception Codes
// ============================================================================

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

/// Human readable name of an exception code
pub fn exception_description(code: u8) -> &'static str {
    match code {
        EXCEPTION_ILLEGAL_FUNCTION => "Illegal Function",
        EXCEPTION_ILLEGAL_DATA_ADDRESS => "Illegal Data Address",
        EXCEPTION_ILLEGAL_DATA_VALUE => "Illegal Data Value",
        EXCEPTION_SERVER_DEVICE_FAILURE => "Server Device Failure",
        EXCEPTION_ACKNOWLEDGE => "Acknowledge",
        EXCEPTION_SERVER_DEVICE_BUSY => "Server Device Busy",
        EXCEPTION_MEMORY_PARITY_ERROR => "Memory Parity Error",
        EXCEPTION_GATEWAY_PATH_UNAVAILABLE => "Gateway Path Unavailable",
        EXCEPTION_GATEWAY_TARGET_FAILED => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

// ============================================================================
// Manager Defaults
// ============================================================================

pub const DEFAULT_TCP_PORT: u16 = 502;
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Per-transaction response deadline
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 1000;

/// Upper bound on a single TCP connect attempt
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Re-sends after the first attempt before a request is reported failed
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// Requests that may wait in the queue behind the active transaction
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 32;

/// First reconnect delay; doubles per failed attempt
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;

/// Reconnect delay ceiling
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;

/// Resolution of the poll/watchdog tick
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 50;

/// Poll interval for 16-bit sensors
pub const DEFAULT_POLL_INTERVAL_16_MS: u64 = 30_000;

/// Poll interval for 32-bit sensors
pub const DEFAULT_POLL_INTERVAL_32_MS: u64 = 60_000;

/// Scale applied to 16-bit sensors when none is configured
pub const DEFAULT_SCALE_16: f64 = 0.1;

/// Scale applied to 32-bit sensors when none is configured
pub const DEFAULT_SCALE_32: f64 = 1.0;

pub const DEFAULT_ACCURACY_DECIMALS: u8 = 2;
pub const MAX_ACCURACY_DECIMALS: u8 = 6;

pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 10_000;

/// Pause between the watchdog counter write and its read-back
pub const DEFAULT_WATCHDOG_READBACK_DELAY_MS: u64 = 100;

/// Capacity of the handle → manager command channel
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 6);
        assert_eq!(MBAP_HEADER_WITH_UNIT_LEN, 7);
        assert_eq!(MAX_MBAP_LENGTH, 254);
        assert!(RX_BUFFER_CAPACITY >= MBAP_HEADER_LEN + MAX_MBAP_LENGTH);
    }

    #[test]
    fn test_register_limits_fit_pdu() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);

        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS * 2);
        assert!(write_pdu_size <= MAX_PDU_SIZE);
        assert_eq!(MAX_WRITE_REGISTERS, 123);

        let coil_pdu = 1 + 1 + MAX_READ_COILS.div_ceil(8);
        assert!(coil_pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_exception_descriptions() {
        assert_eq!(exception_description(0x02), "Illegal Data Address");
        assert_eq!(exception_description(0x0B), "Gateway Target Device Failed to Respond");
        assert_eq!(exception_description(0x7F), "Unknown Exception");
    }

    #[test]
    fn test_defaults_are_consistent() {
        assert!(DEFAULT_BACKOFF_INITIAL_MS <= DEFAULT_BACKOFF_MAX_MS);
        assert!(DEFAULT_ACCURACY_DECIMALS <= MAX_ACCURACY_DECIMALS);
        assert!(DEFAULT_WATCHDOG_READBACK_DELAY_MS < DEFAULT_WATCHDOG_INTERVAL_MS);
    }
}
