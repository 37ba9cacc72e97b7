//! # Voltage Modbus Manager - Modbus TCP master for polled sensors
//!
//! A Modbus TCP master that lets many periodic sensor pollers and
//! application-triggered writes share one connection to one slave.
//!
//! ## Features
//!
//! - **One transaction at a time**: a single FIFO, transaction-id correlation
//!   and per-request deadlines
//! - **Self-healing link**: lazy or eager connect, exponential reconnect backoff,
//!   bounded retries for timeouts and connection losses
//! - **Value decoding**: 16/32-bit signed and unsigned values in `AB_CD`,
//!   `CD_AB` or `DC_BA` order, scale, offset and display accuracy
//! - **Watchdog**: counter write/read-back with safe-mode writes on failure
//! - **Actor runtime**: one tokio task per manager, controlled through a
//!   cloneable [`ManagerHandle`]
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Used by |
//! |------|----------|---------|
//! | 0x01 | Read Coils | pollers |
//! | 0x02 | Read Discrete Inputs | pollers |
//! | 0x03 | Read Holding Registers | pollers, watchdog |
//! | 0x04 | Read Input Registers | pollers |
//! | 0x06 | Write Single Register | writes, watchdog, safe mode |
//! | 0x10 | Write Multiple Registers | writes |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_manager::{
//!     ByteOrder, ManagerConfig, ModbusResult, ModbusTcpManager, PollerDescriptor, Reading,
//!     ValueFormat,
//! };
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let (handle, task) = ModbusTcpManager::spawn(ManagerConfig::new("192.168.1.50"))?;
//!
//!     let energy = PollerDescriptor::new(
//!         "energy",
//!         100,
//!         Arc::new(|reading: &Reading| println!("{}", reading)),
//!     )
//!     .with_format(ValueFormat::Uint32)
//!     .with_byte_order(ByteOrder::CdAb);
//!     handle.register_poller(energy).await?;
//!
//!     handle.write_06(200, -5).await?;
//!
//!     handle.shutdown().await;
//!     let _ = task.await;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants and manager defaults
pub mod constants;

/// Stack-allocated PDU and typed request/response payloads
pub mod pdu;

/// MBAP framing
pub mod frame;

/// Packet logging helpers
pub mod logging;

// ============================================================================
// Values
// ============================================================================

/// Register value formats and readings
pub mod value;

/// Word and byte order of 32-bit values
pub mod byte_order;

/// Raw words to scaled readings
pub mod codec;

// ============================================================================
// Manager
// ============================================================================

/// TCP connection lifecycle and reconnect backoff
pub mod connection;

/// Queued requests and transactions
pub mod request;

/// Single-in-flight request scheduler
pub mod scheduler;

/// Sensor poller registrations
pub mod poller;

/// Watchdog and safe mode
pub mod watchdog;

/// Manager configuration
pub mod config;

/// Manager task
pub mod manager;

/// Handle to a running manager
pub mod client;

/// Triggerable write actions
pub mod action;

/// Mock slave for tests and demos
pub mod testing;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_modbus_manager::tokio) ===
pub use tokio;

// === Manager API ===
pub use client::{ManagerHandle, PendingWrite};
pub use config::{ManagerConfig, SensorConfig};
pub use manager::{ManagerStats, ModbusTcpManager};

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Core types ===
pub use byte_order::ByteOrder;
pub use codec::{Scaling, Transcoder};
pub use connection::{BackoffConfig, ConnectionState};
pub use pdu::{ReadFunction, RequestPdu, ResponseBody};
pub use value::{ModbusValue, Reading, ValueFormat};

// === Pollers and actions ===
pub use action::{Templatable, WriteAction, WriteMultipleRegistersAction, WriteRegisterAction};
pub use poller::{ChannelSink, PollerDescriptor, PollerId, ReadingSink};
pub use watchdog::{SafeModeWrite, WatchdogConfig};

// === Monitoring ===
pub use connection::ConnectionStats;
pub use scheduler::SchedulerStats;

// === Protocol limits (commonly needed constants) ===
pub use constants::{MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = constants::DEFAULT_TCP_PORT;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Manager v{} - Modbus TCP master", VERSION)
}
