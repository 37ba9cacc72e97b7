//! Modbus TCP frame codec
//!
//! Pure transforms between typed requests/responses and MBAP frames:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────┬──────────────┐
//! │ TID (2)  │ PID (2)  │ LEN (2)  │ UNIT(1) │ PDU (≤ 253)  │
//! └──────────┴──────────┴──────────┴─────────┴──────────────┘
//!                          LEN = 1 + PDU length
//! ```
//!
//! Decoders take a `BytesMut` receive buffer and split off exactly one frame
//! when it is complete; a partial frame is left untouched and reported as
//! [`Decoded::Incomplete`].

use bytes::{Buf, BufMut, BytesMut};

use crate::constants::{
    EXCEPTION_FLAG, MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MBAP_HEADER_WITH_UNIT_LEN,
    MIN_MBAP_LENGTH, MODBUS_PROTOCOL_ID,
};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{ModbusPdu, RequestPdu, ResponseBody};

/// MBAP header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Unit ID + PDU length
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length: (pdu_len + 1) as u16,
            unit_id,
        }
    }

    /// Parse the header at the front of `buf`
    ///
    /// Returns `Ok(None)` when fewer than seven bytes are available. A
    /// non-zero protocol id or an out-of-range length means the stream is
    /// out of sync and yields a protocol error.
    pub fn peek(buf: &[u8]) -> ModbusResult<Option<Self>> {
        if buf.len() < MBAP_HEADER_WITH_UNIT_LEN {
            return Ok(None);
        }
        let header = Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        };

        if header.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(ModbusError::protocol(format!(
                "Invalid protocol id {} (expected 0)",
                header.protocol_id
            )));
        }
        let length = header.length as usize;
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(ModbusError::protocol(format!(
                "Invalid MBAP length {} ({}-{})",
                length, MIN_MBAP_LENGTH, MAX_MBAP_LENGTH
            )));
        }
        Ok(Some(header))
    }

    /// Total frame size on the wire
    #[inline]
    pub fn frame_len(&self) -> usize {
        MBAP_HEADER_LEN + self.length as usize
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
    }
}

/// A complete non-exception response
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub header: MbapHeader,
    pub pdu: ModbusPdu,
}

impl ResponseFrame {
    /// Decode the payload against the request it answers
    pub fn interpret(&self, request: &RequestPdu) -> ModbusResult<ResponseBody> {
        ResponseBody::parse(request, &self.pdu)
    }
}

/// A complete exception response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionFrame {
    pub header: MbapHeader,
    /// Function code of the failed request (exception bit cleared)
    pub function: u8,
    pub code: u8,
}

impl ExceptionFrame {
    pub fn to_error(&self) -> ModbusError {
        ModbusError::exception(self.function, self.code)
    }
}

/// A well-delimited frame whose PDU could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedFrame {
    pub header: MbapHeader,
    pub error: ModbusError,
}

/// Outcome of one decode attempt
#[derive(Debug, Clone)]
pub enum Decoded {
    Response(ResponseFrame),
    Exception(ExceptionFrame),
    Malformed(MalformedFrame),
    Incomplete,
}

impl Decoded {
    pub fn header(&self) -> Option<&MbapHeader> {
        match self {
            Self::Response(frame) => Some(&frame.header),
            Self::Exception(frame) => Some(&frame.header),
            Self::Malformed(frame) => Some(&frame.header),
            Self::Incomplete => None,
        }
    }
}

fn frame_pdu(header: MbapHeader, pdu: &ModbusPdu) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_WITH_UNIT_LEN + pdu.len());
    header.write_to(&mut frame);
    frame.put_slice(pdu.as_slice());
    frame
}

/// Split one complete frame off the buffer
fn take_frame(buf: &mut BytesMut) -> ModbusResult<Option<(MbapHeader, BytesMut)>> {
    let Some(header) = MbapHeader::peek(buf)? else {
        return Ok(None);
    };
    if buf.len() < header.frame_len() {
        return Ok(None);
    }
    let mut frame = buf.split_to(header.frame_len());
    frame.advance(MBAP_HEADER_WITH_UNIT_LEN);
    Ok(Some((header, frame)))
}

/// Encode a request into a complete MBAP frame
pub fn encode_request(
    unit_id: u8,
    transaction_id: u16,
    request: &RequestPdu,
) -> ModbusResult<BytesMut> {
    let pdu = request.to_pdu()?;
    Ok(frame_pdu(
        MbapHeader::new(transaction_id, unit_id, pdu.len()),
        &pdu,
    ))
}

/// Decode the response at the front of `buf`
///
/// On success the frame is consumed. A protocol error in the header leaves
/// the buffer as is and the caller must discard it. A well-delimited frame
/// with a bad PDU is consumed and reported as [`Decoded::Malformed`] so it
/// can still be correlated by transaction id.
pub fn decode_response(buf: &mut BytesMut) -> ModbusResult<Decoded> {
    let Some((header, pdu_bytes)) = take_frame(buf)? else {
        return Ok(Decoded::Incomplete);
    };
    Ok(decode_pdu(header, &pdu_bytes)
        .unwrap_or_else(|error| Decoded::Malformed(MalformedFrame { header, error })))
}

fn decode_pdu(header: MbapHeader, pdu_bytes: &[u8]) -> ModbusResult<Decoded> {
    let pdu = ModbusPdu::from_slice(pdu_bytes)?;
    if !pdu.is_exception() {
        return Ok(Decoded::Response(ResponseFrame { header, pdu }));
    }

    match (pdu.len(), pdu.function_code(), pdu.exception_code()) {
        (2, Some(fc), Some(code)) => Ok(Decoded::Exception(ExceptionFrame {
            header,
            function: fc & !EXCEPTION_FLAG,
            code,
        })),
        (len, ..) => Err(ModbusError::protocol(format!(
            "Exception response must carry 2 PDU bytes, got {}",
            len
        ))),
    }
}

/// Decode the request at the front of `buf`, as a slave would
pub fn decode_request(buf: &mut BytesMut) -> ModbusResult<Option<(MbapHeader, RequestPdu)>> {
    let Some((header, pdu_bytes)) = take_frame(buf)? else {
        return Ok(None);
    };
    let pdu = ModbusPdu::from_slice(&pdu_bytes)?;
    Ok(Some((header, RequestPdu::from_pdu(&pdu)?)))
}

/// Encode a normal response frame for `function`
pub fn encode_response(
    transaction_id: u16,
    unit_id: u8,
    function: u8,
    body: &ResponseBody,
) -> ModbusResult<BytesMut> {
    let pdu = body.to_pdu(function)?;
    Ok(frame_pdu(
        MbapHeader::new(transaction_id, unit_id, pdu.len()),
        &pdu,
    ))
}

/// Encode an exception response frame
pub fn encode_exception(transaction_id: u16, unit_id: u8, function: u8, code: u8) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_WITH_UNIT_LEN + 2);
    MbapHeader::new(transaction_id, unit_id, 2).write_to(&mut frame);
    frame.put_u8(function | EXCEPTION_FLAG);
    frame.put_u8(code);
    frame
}
