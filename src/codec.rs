//! # Value transcoder
//!
//! Turns the registers (or bits) of a read response into a [`Reading`]:
//!
//! 1. reconstruct the raw integer from one or two words under a [`ByteOrder`]
//! 2. apply `raw * scale + offset`
//! 3. attach the accuracy used when the value is displayed
//!
//! The raw integer is kept alongside the scaled value.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::byte_order::ByteOrder;
use crate::constants::{DEFAULT_ACCURACY_DECIMALS, MAX_ACCURACY_DECIMALS};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ResponseBody;
use crate::value::{ModbusValue, Reading, ValueFormat};

/// Reconstruct a value from registers
///
/// 16-bit formats use the first word as is; 32-bit formats combine the
/// first two words under `byte_order`.
pub fn decode_registers(
    registers: &[u16],
    format: ValueFormat,
    byte_order: ByteOrder,
) -> ModbusResult<ModbusValue> {
    let needed = format.register_count() as usize;
    if registers.len() < needed {
        return Err(ModbusError::invalid_data(format!(
            "Not enough registers for {:?}: need {}, got {}",
            format,
            needed,
            registers.len()
        )));
    }

    let value = match format {
        ValueFormat::Bool => ModbusValue::Bool(registers[0] != 0),
        ValueFormat::Uint16 => ModbusValue::U16(registers[0]),
        ValueFormat::Int16 => ModbusValue::I16(registers[0] as i16),
        ValueFormat::Uint32 => {
            ModbusValue::U32(byte_order.words_to_u32([registers[0], registers[1]]))
        }
        ValueFormat::Int32 => {
            ModbusValue::I32(byte_order.words_to_u32([registers[0], registers[1]]) as i32)
        }
    };
    Ok(value)
}

/// Registers a device would hold for `value`
pub fn encode_value(value: ModbusValue, byte_order: ByteOrder) -> Vec<u16> {
    match value {
        ModbusValue::Bool(b) => vec![u16::from(b)],
        ModbusValue::U16(v) => vec![v],
        ModbusValue::I16(v) => vec![v as u16],
        ModbusValue::U32(v) => byte_order.u32_to_words(v).to_vec(),
        ModbusValue::I32(v) => byte_order.u32_to_words(v as u32).to_vec(),
    }
}

/// Linear conversion from raw integer to engineering value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_accuracy")]
    pub accuracy_decimals: u8,
}

fn default_accuracy() -> u8 {
    DEFAULT_ACCURACY_DECIMALS
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: 0.0,
            accuracy_decimals: DEFAULT_ACCURACY_DECIMALS,
        }
    }
}

impl Scaling {
    pub fn new(scale: f64) -> Self {
        Self {
            scale,
            ..Self::default()
        }
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_accuracy(mut self, accuracy_decimals: u8) -> Self {
        self.accuracy_decimals = accuracy_decimals;
        self
    }

    #[inline]
    pub fn apply(&self, raw: i64) -> f64 {
        raw as f64 * self.scale + self.offset
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if !self.scale.is_finite() || !self.offset.is_finite() {
            return Err(ModbusError::configuration("scale and offset must be finite"));
        }
        if self.accuracy_decimals > MAX_ACCURACY_DECIMALS {
            return Err(ModbusError::configuration(format!(
                "accuracy_decimals {} out of range (0-{})",
                self.accuracy_decimals, MAX_ACCURACY_DECIMALS
            )));
        }
        Ok(())
    }
}

/// Per-sensor decoding rules: format, byte order and scaling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transcoder {
    pub format: ValueFormat,
    pub byte_order: ByteOrder,
    pub scaling: Scaling,
}

impl Transcoder {
    pub fn new(format: ValueFormat, byte_order: ByteOrder, scaling: Scaling) -> Self {
        Self {
            format,
            byte_order,
            scaling,
        }
    }

    /// Raw value carried by a read response
    pub fn raw_value(&self, body: &ResponseBody) -> ModbusResult<ModbusValue> {
        match body {
            ResponseBody::Registers(words) => decode_registers(words, self.format, self.byte_order),
            ResponseBody::Bits(bits) => bits
                .first()
                .map(|bit| ModbusValue::Bool(*bit))
                .ok_or_else(|| ModbusError::invalid_data("Empty bit response")),
            other => Err(ModbusError::protocol(format!(
                "Expected read response, got {:?}",
                other
            ))),
        }
    }

    /// Full decode into a timestamped reading
    pub fn transcode(&self, sensor: &str, body: &ResponseBody) -> ModbusResult<Reading> {
        let raw = self.raw_value(body)?.as_i64();
        Ok(Reading {
            sensor: sensor.to_string(),
            raw,
            value: self.scaling.apply(raw),
            accuracy_decimals: self.scaling.accuracy_decimals,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_16bit_ignores_byte_order() {
        for order in [ByteOrder::AbCd, ByteOrder::CdAb, ByteOrder::DcBa] {
            assert_eq!(
                decode_registers(&[0xFFFE], ValueFormat::Int16, order).unwrap(),
                ModbusValue::I16(-2)
            );
            assert_eq!(
                decode_registers(&[0xFFFE], ValueFormat::Uint16, order).unwrap(),
                ModbusValue::U16(0xFFFE)
            );
        }
    }

    #[test]
    fn test_decode_32bit_orders() {
        let words = [0x0001, 0x0002];
        assert_eq!(
            decode_registers(&words, ValueFormat::Uint32, ByteOrder::CdAb).unwrap(),
            ModbusValue::U32(131073)
        );
        assert_eq!(
            decode_registers(&words, ValueFormat::Uint32, ByteOrder::AbCd).unwrap(),
            ModbusValue::U32(0x0001_0002)
        );
        assert_eq!(
            decode_registers(&words, ValueFormat::Uint32, ByteOrder::DcBa).unwrap(),
            ModbusValue::U32(0x0200_0100)
        );
        assert_eq!(
            decode_registers(&[0xFFFF, 0xFFFF], ValueFormat::Int32, ByteOrder::AbCd).unwrap(),
            ModbusValue::I32(-1)
        );
    }

    #[test]
    fn test_decode_short_input() {
        assert!(decode_registers(&[1], ValueFormat::Uint32, ByteOrder::AbCd).is_err());
        assert!(decode_registers(&[], ValueFormat::Int16, ByteOrder::AbCd).is_err());
    }

    #[test]
    fn test_scaling() {
        let scaling = Scaling::new(0.1).with_offset(-40.0).with_accuracy(1);
        assert!((scaling.apply(655) - 25.5).abs() < 1e-9);
        assert!(scaling.validate().is_ok());
        assert!(Scaling::default().with_accuracy(7).validate().is_err());
        assert!(Scaling::new(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_transcode_reading() {
        let transcoder = Transcoder::new(
            ValueFormat::Int16,
            ByteOrder::AbCd,
            Scaling::new(0.1).with_accuracy(1),
        );
        let reading = transcoder
            .transcode("temp", &ResponseBody::Registers(vec![(-215i16) as u16]))
            .unwrap();
        assert_eq!(reading.raw, -215);
        assert_eq!(reading.to_string(), "-21.5");
        assert_eq!(reading.sensor, "temp");
    }

    #[test]
    fn test_transcode_bits_and_wrong_body() {
        let transcoder = Transcoder::new(ValueFormat::Bool, ByteOrder::AbCd, Scaling::default());
        let reading = transcoder
            .transcode("door", &ResponseBody::Bits(vec![true]))
            .unwrap();
        assert_eq!(reading.raw, 1);

        let write_echo = ResponseBody::WriteSingleRegister { address: 0, value: 0 };
        assert!(transcoder.transcode("door", &write_echo).is_err());
    }

    proptest! {
        #[test]
        fn prop_32bit_round_trip(value in any::<i32>(), order_idx in 0usize..3) {
            let order = [ByteOrder::AbCd, ByteOrder::CdAb, ByteOrder::DcBa][order_idx];
            let words = encode_value(ModbusValue::I32(value), order);
            prop_assert_eq!(
                decode_registers(&words, ValueFormat::Int32, order).unwrap(),
                ModbusValue::I32(value)
            );
            let words = encode_value(ModbusValue::U32(value as u32), order);
            prop_assert_eq!(
                decode_registers(&words, ValueFormat::Uint32, order).unwrap(),
                ModbusValue::U32(value as u32)
            );
        }
    }
}
