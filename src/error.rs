//! Error types for the Modbus TCP manager
//!
//! Every failure a request can end with maps to one [`ModbusError`] variant.
//! The manager uses [`ModbusError::is_retryable`] to decide whether a request
//! goes back into the queue or is reported to its originator.

use thiserror::Error;

use crate::constants::exception_description;

/// Result alias used across the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModbusError {
    /// Socket could not be opened, was closed by the peer, or failed on I/O
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// No matching response before the transaction deadline
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The slave answered with an exception response
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Malformed frame or a response that does not match its request
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Request parameters rejected before reaching the wire
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Submission rejected because the request queue is at capacity
    #[error("Request queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// The manager task has stopped
    #[error("Manager closed")]
    Closed,
}

impl ModbusError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Build an exception error from the function code of the original request
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            message: exception_description(code).to_string(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn queue_full(capacity: usize) -> Self {
        Self::QueueFull { capacity }
    }

    /// Transient failures that warrant re-sending the request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Failures detected before a request was queued
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidData { .. } | Self::InvalidFunction { .. } | Self::Configuration { .. }
        )
    }

    /// Exception code carried by an exception response, if any
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            Self::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::connection(err.to_string())
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(err.to_string())
    }
}
