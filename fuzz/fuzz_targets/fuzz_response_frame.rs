#![no_main]

use arbitrary::Arbitrary;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use voltage_modbus_manager::frame::{decode_response, Decoded};
use voltage_modbus_manager::{ModbusError, ReadFunction, RequestPdu};

#[derive(Debug, Arbitrary)]
struct Input {
    function: u8,
    address: u16,
    quantity: u16,
    stream: Vec<u8>,
}

// Arbitrary bytes in the receive buffer must never panic the decoder, and
// every decoded response must be interpretable without panicking.
fuzz_target!(|input: Input| {
    let request = match input.function % 6 {
        0..=3 => {
            let function = match ReadFunction::from_code(input.function % 4 + 1) {
                Ok(function) => function,
                Err(_) => return,
            };
            match RequestPdu::read(function, input.address, input.quantity) {
                Ok(request) => request,
                Err(_) => return,
            }
        }
        4 => RequestPdu::write_single(input.address, input.quantity),
        _ => match RequestPdu::write_multiple(input.address, vec![0; input.quantity as usize % 124]) {
            Ok(request) => request,
            Err(_) => return,
        },
    };

    let mut buf = BytesMut::from(&input.stream[..]);
    while let Ok(decoded) = decode_response(&mut buf) {
        match decoded {
            Decoded::Response(frame) => {
                let _ = frame.interpret(&request);
            }
            Decoded::Exception(frame) => {
                let _ = frame.to_error();
            }
            Decoded::Malformed(frame) => {
                assert!(matches!(frame.error, ModbusError::Protocol { .. }));
            }
            Decoded::Incomplete => break,
        }
    }
});
