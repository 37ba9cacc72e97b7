#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use voltage_modbus_manager::frame::{decode_request, encode_request};

// Whatever decodes as a request must encode and decode back to itself.
fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);
    if let Ok(Some((header, request))) = decode_request(&mut buf) {
        let mut frame = encode_request(header.unit_id, header.transaction_id, &request)
            .expect("decoded request re-encodes");
        let (_, again) = decode_request(&mut frame)
            .expect("re-encoded request decodes")
            .expect("re-encoded request is complete");
        assert_eq!(request, again);
    }
});
