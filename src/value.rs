//! # Register value types
//!
//! | Format | Registers | Config names |
//! |--------|-----------|--------------|
//! | Bool   | 1 bit (coil / discrete input) | bool |
//! | U16/I16 | 1 | uint16, int16 |
//! | U32/I32 | 2 | uint32, int32 |

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Layout of a sensor's raw value in the device's register map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueFormat {
    #[serde(alias = "coil")]
    Bool,
    #[serde(alias = "u16")]
    Uint16,
    #[serde(alias = "i16")]
    Int16,
    #[serde(alias = "u32")]
    Uint32,
    #[serde(alias = "i32")]
    Int32,
}

impl ValueFormat {
    /// Registers (or bits, for `Bool`) read per poll
    #[inline]
    pub fn register_count(self) -> u16 {
        match self {
            Self::Bool | Self::Uint16 | Self::Int16 => 1,
            Self::Uint32 | Self::Int32 => 2,
        }
    }

    #[inline]
    pub fn is_32bit(self) -> bool {
        self.register_count() == 2
    }
}

/// A decoded raw value before scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusValue {
    Bool(bool),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
}

impl ModbusValue {
    #[inline]
    pub fn as_i64(&self) -> i64 {
        match self {
            ModbusValue::Bool(b) => i64::from(*b),
            ModbusValue::U16(v) => i64::from(*v),
            ModbusValue::I16(v) => i64::from(*v),
            ModbusValue::U32(v) => i64::from(*v),
            ModbusValue::I32(v) => i64::from(*v),
        }
    }

    #[inline]
    pub fn as_f64(&self) -> f64 {
        self.as_i64() as f64
    }

    pub fn format(&self) -> ValueFormat {
        match self {
            ModbusValue::Bool(_) => ValueFormat::Bool,
            ModbusValue::U16(_) => ValueFormat::Uint16,
            ModbusValue::I16(_) => ValueFormat::Int16,
            ModbusValue::U32(_) => ValueFormat::Uint32,
            ModbusValue::I32(_) => ValueFormat::Int32,
        }
    }
}

impl fmt::Display for ModbusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusValue::Bool(v) => write!(f, "{}", v),
            other => write!(f, "{}", other.as_i64()),
        }
    }
}

impl From<bool> for ModbusValue {
    fn from(v: bool) -> Self {
        ModbusValue::Bool(v)
    }
}

impl From<u16> for ModbusValue {
    fn from(v: u16) -> Self {
        ModbusValue::U16(v)
    }
}

impl From<i16> for ModbusValue {
    fn from(v: i16) -> Self {
        ModbusValue::I16(v)
    }
}

impl From<u32> for ModbusValue {
    fn from(v: u32) -> Self {
        ModbusValue::U32(v)
    }
}

impl From<i32> for ModbusValue {
    fn from(v: i32) -> Self {
        ModbusValue::I32(v)
    }
}

/// A published sensor reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub sensor: String,
    /// Integer reconstructed from the registers, before scaling
    pub raw: i64,
    /// `raw * scale + offset`, unrounded
    pub value: f64,
    pub accuracy_decimals: u8,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Value rounded to the configured accuracy
    pub fn rounded(&self) -> f64 {
        let factor = 10f64.powi(i32::from(self.accuracy_decimals));
        (self.value * factor).round() / factor
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.*}",
            usize::from(self.accuracy_decimals),
            self.rounded()
        )
    }
}
