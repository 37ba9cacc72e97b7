//! Modbus PDU model
//!
//! [`ModbusPdu`] is a stack-allocated byte buffer sized to the protocol
//! maximum. [`RequestPdu`] and [`ResponseBody`] are the typed views the
//! scheduler works with; conversion between the two representations lives
//! here so the framing layer only deals with MBAP headers.

use std::fmt;

use tracing::{debug, trace};

use crate::constants::{
    EXCEPTION_FLAG, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER,
    MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};

/// PDU bytes held in a fixed stack array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Copy a received PDU into a fresh buffer
    pub fn from_slice(data: &[u8]) -> ModbusResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();

        if let Some(fc) = pdu.function_code() {
            trace!(
                "PDU parsed: FC={:02X} ({}), len={}",
                fc,
                function_code_description(fc),
                pdu.len
            );
        }
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }

    /// Big-endian u16 at `offset`, if the PDU is long enough
    #[inline]
    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        if offset + 2 > self.len {
            return None;
        }
        Some(u16::from_be_bytes([self.data[offset], self.data[offset + 1]]))
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable function code name, exception bit ignored
pub fn function_code_description(fc: u8) -> &'static str {
    match fc & !EXCEPTION_FLAG {
        FC_READ_COILS => "Read Coils",
        FC_READ_DISCRETE_INPUTS => "Read Discrete Inputs",
        FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
        FC_READ_INPUT_REGISTERS => "Read Input Registers",
        FC_WRITE_SINGLE_REGISTER => "Write Single Register",
        FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
        _ => "Unknown Function",
    }
}

/// Fluent PDU builder
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn word(mut self, value: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    #[inline]
    pub fn words(mut self, values: &[u16]) -> ModbusResult<Self> {
        for &value in values {
            self.pdu.push_u16(value)?;
        }
        Ok(self)
    }

    #[inline]
    pub fn bytes(mut self, data: &[u8]) -> ModbusResult<Self> {
        for &b in data {
            self.pdu.push(b)?;
        }
        Ok(self)
    }

    #[inline]
    pub fn build(self) -> ModbusPdu {
        self.pdu
    }
}

// ============================================================================
// Requests
// ============================================================================

/// The read function codes a poller may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadFunction {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl ReadFunction {
    pub fn code(self) -> u8 {
        match self {
            Self::Coils => FC_READ_COILS,
            Self::DiscreteInputs => FC_READ_DISCRETE_INPUTS,
            Self::HoldingRegisters => FC_READ_HOLDING_REGISTERS,
            Self::InputRegisters => FC_READ_INPUT_REGISTERS,
        }
    }

    pub fn from_code(code: u8) -> ModbusResult<Self> {
        match code {
            FC_READ_COILS => Ok(Self::Coils),
            FC_READ_DISCRETE_INPUTS => Ok(Self::DiscreteInputs),
            FC_READ_HOLDING_REGISTERS => Ok(Self::HoldingRegisters),
            FC_READ_INPUT_REGISTERS => Ok(Self::InputRegisters),
            other => Err(ModbusError::invalid_function(other)),
        }
    }

    /// Coils and discrete inputs address single bits
    pub fn is_bit_access(self) -> bool {
        matches!(self, Self::Coils | Self::DiscreteInputs)
    }

    fn max_quantity(self) -> usize {
        if self.is_bit_access() {
            MAX_READ_COILS
        } else {
            MAX_READ_REGISTERS
        }
    }
}

/// Classification of a queued request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Poll,
    WriteSingle,
    WriteMultiple,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Poll => "poll",
            Self::WriteSingle => "write",
            Self::WriteMultiple => "write-multiple",
        })
    }
}

/// A validated request PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPdu {
    Read {
        function: ReadFunction,
        address: u16,
        quantity: u16,
    },
    WriteSingleRegister {
        address: u16,
        value: u16,
    },
    WriteMultipleRegisters {
        address: u16,
        values: Vec<u16>,
    },
}

impl RequestPdu {
    pub fn read(function: ReadFunction, address: u16, quantity: u16) -> ModbusResult<Self> {
        let request = Self::Read {
            function,
            address,
            quantity,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn write_single(address: u16, value: u16) -> Self {
        Self::WriteSingleRegister { address, value }
    }

    pub fn write_multiple(address: u16, values: Vec<u16>) -> ModbusResult<Self> {
        let request = Self::WriteMultipleRegisters { address, values };
        request.validate()?;
        Ok(request)
    }

    /// Check quantities against protocol limits and the 16-bit address space
    pub fn validate(&self) -> ModbusResult<()> {
        let (address, quantity, max) = match self {
            Self::Read {
                function,
                address,
                quantity,
            } => (*address, *quantity as usize, function.max_quantity()),
            Self::WriteSingleRegister { .. } => return Ok(()),
            Self::WriteMultipleRegisters { address, values } => {
                (*address, values.len(), MAX_WRITE_REGISTERS)
            }
        };

        if quantity == 0 || quantity > max {
            return Err(ModbusError::invalid_data(format!(
                "Invalid quantity {} for {} (1-{})",
                quantity,
                function_code_description(self.function_code()),
                max
            )));
        }
        if address as usize + quantity - 1 > u16::MAX as usize {
            return Err(ModbusError::invalid_data(format!(
                "Address range {}+{} exceeds 65535",
                address, quantity
            )));
        }
        Ok(())
    }

    pub fn function_code(&self) -> u8 {
        match self {
            Self::Read { function, .. } => function.code(),
            Self::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            Self::Read { address, .. }
            | Self::WriteSingleRegister { address, .. }
            | Self::WriteMultipleRegisters { address, .. } => *address,
        }
    }

    /// Registers or bits addressed by the request
    pub fn quantity(&self) -> u16 {
        match self {
            Self::Read { quantity, .. } => *quantity,
            Self::WriteSingleRegister { .. } => 1,
            Self::WriteMultipleRegisters { values, .. } => values.len() as u16,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Read { .. } => RequestKind::Poll,
            Self::WriteSingleRegister { .. } => RequestKind::WriteSingle,
            Self::WriteMultipleRegisters { .. } => RequestKind::WriteMultiple,
        }
    }

    pub fn to_pdu(&self) -> ModbusResult<ModbusPdu> {
        let pdu = match self {
            Self::Read {
                function,
                address,
                quantity,
            } => PduBuilder::new()
                .function_code(function.code())?
                .word(*address)?
                .word(*quantity)?
                .build(),
            Self::WriteSingleRegister { address, value } => PduBuilder::new()
                .function_code(FC_WRITE_SINGLE_REGISTER)?
                .word(*address)?
                .word(*value)?
                .build(),
            Self::WriteMultipleRegisters { address, values } => PduBuilder::new()
                .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
                .word(*address)?
                .word(values.len() as u16)?
                .byte((values.len() * 2) as u8)?
                .words(values)?
                .build(),
        };
        debug!(
            "Request PDU built: FC={:02X} ({}), addr={}, qty={}, len={}",
            self.function_code(),
            function_code_description(self.function_code()),
            self.address(),
            self.quantity(),
            pdu.len()
        );
        Ok(pdu)
    }

    /// Parse a request PDU as a slave would receive it
    pub fn from_pdu(pdu: &ModbusPdu) -> ModbusResult<Self> {
        let fc = pdu
            .function_code()
            .ok_or_else(|| ModbusError::protocol("Empty request PDU"))?;
        let address = pdu
            .u16_at(1)
            .ok_or_else(|| ModbusError::protocol("Request PDU too short"))?;
        let second = pdu
            .u16_at(3)
            .ok_or_else(|| ModbusError::protocol("Request PDU too short"))?;

        let request = match fc {
            FC_WRITE_SINGLE_REGISTER => Self::write_single(address, second),
            FC_WRITE_MULTIPLE_REGISTERS => {
                let data = pdu.as_slice();
                let byte_count = *data
                    .get(5)
                    .ok_or_else(|| ModbusError::protocol("Missing byte count"))?
                    as usize;
                if byte_count != second as usize * 2 || data.len() != 6 + byte_count {
                    return Err(ModbusError::protocol(format!(
                        "Byte count {} does not match quantity {}",
                        byte_count, second
                    )));
                }
                let values = data[6..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                Self::write_multiple(address, values)?
            }
            other => Self::read(ReadFunction::from_code(other)?, address, second)?,
        };
        Ok(request)
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Decoded payload of a non-exception response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Registers(Vec<u16>),
    Bits(Vec<bool>),
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { address: u16, quantity: u16 },
}

impl ResponseBody {
    /// Interpret a response PDU against the request it answers
    ///
    /// Write responses must echo the request exactly; read responses must
    /// carry the byte count implied by the requested quantity.
    pub fn parse(request: &RequestPdu, pdu: &ModbusPdu) -> ModbusResult<Self> {
        let expected_fc = request.function_code();
        match pdu.function_code() {
            Some(fc) if fc == expected_fc => {}
            Some(fc) => {
                return Err(ModbusError::protocol(format!(
                    "Function code mismatch: expected 0x{:02X}, got 0x{:02X}",
                    expected_fc, fc
                )))
            }
            None => return Err(ModbusError::protocol("Empty response PDU")),
        }

        let data = pdu.as_slice();
        match request {
            RequestPdu::Read {
                function, quantity, ..
            } => {
                let byte_count = *data
                    .get(1)
                    .ok_or_else(|| ModbusError::protocol("Missing byte count"))?
                    as usize;
                let expected = if function.is_bit_access() {
                    (*quantity as usize).div_ceil(8)
                } else {
                    *quantity as usize * 2
                };
                if byte_count != expected || data.len() != 2 + byte_count {
                    return Err(ModbusError::protocol(format!(
                        "Byte count mismatch: expected {}, header {}, payload {}",
                        expected,
                        byte_count,
                        data.len().saturating_sub(2)
                    )));
                }
                let payload = &data[2..];
                if function.is_bit_access() {
                    let bits = (0..*quantity as usize)
                        .map(|i| payload[i / 8] & (1 << (i % 8)) != 0)
                        .collect();
                    Ok(Self::Bits(bits))
                } else {
                    let words = payload
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect();
                    Ok(Self::Registers(words))
                }
            }
            RequestPdu::WriteSingleRegister { address, value } => {
                let echo = Self::write_echo(pdu)?;
                if echo != (*address, *value) {
                    return Err(ModbusError::protocol(format!(
                        "Write echo mismatch: sent ({}, {}), got ({}, {})",
                        address, value, echo.0, echo.1
                    )));
                }
                Ok(Self::WriteSingleRegister {
                    address: echo.0,
                    value: echo.1,
                })
            }
            RequestPdu::WriteMultipleRegisters { address, values } => {
                let echo = Self::write_echo(pdu)?;
                if echo != (*address, values.len() as u16) {
                    return Err(ModbusError::protocol(format!(
                        "Write echo mismatch: sent ({}, {}), got ({}, {})",
                        address,
                        values.len(),
                        echo.0,
                        echo.1
                    )));
                }
                Ok(Self::WriteMultipleRegisters {
                    address: echo.0,
                    quantity: echo.1,
                })
            }
        }
    }

    fn write_echo(pdu: &ModbusPdu) -> ModbusResult<(u16, u16)> {
        if pdu.len() != 5 {
            return Err(ModbusError::protocol(format!(
                "Write response must be 5 bytes, got {}",
                pdu.len()
            )));
        }
        match (pdu.u16_at(1), pdu.u16_at(3)) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(ModbusError::protocol("Write response too short")),
        }
    }

    /// Serialize as the response PDU for `function`
    pub fn to_pdu(&self, function: u8) -> ModbusResult<ModbusPdu> {
        let builder = PduBuilder::new().function_code(function)?;
        let pdu = match self {
            Self::Registers(words) => builder.byte((words.len() * 2) as u8)?.words(words)?,
            Self::Bits(bits) => {
                let mut packed = vec![0u8; bits.len().div_ceil(8)];
                for (i, &bit) in bits.iter().enumerate() {
                    if bit {
                        packed[i / 8] |= 1 << (i % 8);
                    }
                }
                builder.byte(packed.len() as u8)?.bytes(&packed)?
            }
            Self::WriteSingleRegister { address, value } => builder.word(*address)?.word(*value)?,
            Self::WriteMultipleRegisters { address, quantity } => {
                builder.word(*address)?.word(*quantity)?
            }
        };
        Ok(pdu.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_basic_operations() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.is_empty());

        pdu.push(0x03).unwrap();
        pdu.push_u16(0x0100).unwrap();
        pdu.push_u16(0x000A).unwrap();

        assert_eq!(pdu.as_slice(), &[0x03, 0x01, 0x00, 0x00, 0x0A]);
        assert_eq!(pdu.u16_at(1), Some(0x0100));
        assert_eq!(pdu.u16_at(4), None);
        assert!(!pdu.is_exception());
    }

    #[test]
    fn test_exception_pdu() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x02));
        assert_eq!(function_code_description(0x83), "Read Holding Registers");
    }

    #[test]
    fn test_pdu_capacity() {
        assert!(ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE + 1]).is_err());
        let mut pdu = ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE]).unwrap();
        assert!(pdu.push(0).is_err());
    }

    #[test]
    fn test_read_request_bytes() {
        let request = RequestPdu::read(ReadFunction::HoldingRegisters, 0x006B, 3).unwrap();
        assert_eq!(request.kind(), RequestKind::Poll);
        assert_eq!(
            request.to_pdu().unwrap().as_slice(),
            &[0x03, 0x00, 0x6B, 0x00, 0x03]
        );
    }

    #[test]
    fn test_write_single_bytes() {
        let request = RequestPdu::write_single(0x0001, 0x0003);
        assert_eq!(
            request.to_pdu().unwrap().as_slice(),
            &[0x06, 0x00, 0x01, 0x00, 0x03]
        );
    }

    #[test]
    fn test_write_multiple_bytes() {
        let request = RequestPdu::write_multiple(10, vec![1, 2, 3]).unwrap();
        assert_eq!(request.kind(), RequestKind::WriteMultiple);
        assert_eq!(
            request.to_pdu().unwrap().as_slice(),
            &[0x10, 0x00, 0x0A, 0x00, 0x03, 0x06, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03]
        );
    }

    #[test]
    fn test_request_validation() {
        assert!(RequestPdu::read(ReadFunction::HoldingRegisters, 0, 0).is_err());
        assert!(RequestPdu::read(ReadFunction::InputRegisters, 0, 126).is_err());
        assert!(RequestPdu::read(ReadFunction::Coils, 0, 2000).is_ok());
        assert!(RequestPdu::read(ReadFunction::HoldingRegisters, 65535, 2).is_err());
        assert!(RequestPdu::write_multiple(0, vec![]).is_err());
        assert!(RequestPdu::write_multiple(0, vec![0; 124]).is_err());
        assert!(RequestPdu::write_multiple(0, vec![0; 123]).is_ok());
        assert!(matches!(
            ReadFunction::from_code(0x07),
            Err(ModbusError::InvalidFunction { code: 0x07 })
        ));
    }

    #[test]
    fn test_request_from_pdu() {
        let request = RequestPdu::write_multiple(0x20, vec![0xABCD, 0x0001]).unwrap();
        let parsed = RequestPdu::from_pdu(&request.to_pdu().unwrap()).unwrap();
        assert_eq!(parsed, request);

        let bad = ModbusPdu::from_slice(&[0x10, 0x00, 0x00, 0x00, 0x02, 0x03, 0, 0, 0]).unwrap();
        assert!(RequestPdu::from_pdu(&bad).is_err());
    }

    #[test]
    fn test_parse_register_response() {
        let request = RequestPdu::read(ReadFunction::HoldingRegisters, 100, 2).unwrap();
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x00, 0x01, 0x00, 0x02]).unwrap();
        assert_eq!(
            ResponseBody::parse(&request, &pdu).unwrap(),
            ResponseBody::Registers(vec![0x0001, 0x0002])
        );

        let short = ModbusPdu::from_slice(&[0x03, 0x04, 0x00, 0x01]).unwrap();
        assert!(matches!(
            ResponseBody::parse(&request, &short),
            Err(ModbusError::Protocol { .. })
        ));
    }

    #[test]
    fn test_parse_bit_response() {
        let request = RequestPdu::read(ReadFunction::Coils, 0, 10).unwrap();
        let pdu = ModbusPdu::from_slice(&[0x01, 0x02, 0b0000_0101, 0b0000_0010]).unwrap();
        let ResponseBody::Bits(bits) = ResponseBody::parse(&request, &pdu).unwrap() else {
            panic!("expected bits");
        };
        assert_eq!(bits.len(), 10);
        assert!(bits[0] && !bits[1] && bits[2] && bits[9]);
    }

    #[test]
    fn test_parse_write_echo() {
        let request = RequestPdu::write_single(5, 0x1234);
        let ok = ModbusPdu::from_slice(&[0x06, 0x00, 0x05, 0x12, 0x34]).unwrap();
        assert!(ResponseBody::parse(&request, &ok).is_ok());

        let wrong = ModbusPdu::from_slice(&[0x06, 0x00, 0x05, 0x12, 0x35]).unwrap();
        assert!(matches!(
            ResponseBody::parse(&request, &wrong),
            Err(ModbusError::Protocol { .. })
        ));

        let other_fc = ModbusPdu::from_slice(&[0x10, 0x00, 0x05, 0x00, 0x01]).unwrap();
        assert!(ResponseBody::parse(&request, &other_fc).is_err());
    }

    #[test]
    fn test_response_to_pdu() {
        let body = ResponseBody::Bits(vec![true, false, true]);
        assert_eq!(body.to_pdu(0x02).unwrap().as_slice(), &[0x02, 0x01, 0b101]);

        let body = ResponseBody::Registers(vec![0x0102]);
        assert_eq!(body.to_pdu(0x04).unwrap().as_slice(), &[0x04, 0x02, 0x01, 0x02]);
    }
}
