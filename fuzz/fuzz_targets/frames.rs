#![no_main]

use libfuzzer_sys::fuzz_target;
use usbtap::{
    filter::AddressFilter,
    frame::{self, ENVELOPE_HEADER_LEN},
};

fuzz_target!(|data: &[u8]| {
    if let Some(payload) = frame::decode(data) {
        assert!(payload.len() + ENVELOPE_HEADER_LEN <= data.len());
    }

    let mut total = 0;
    for record in frame::records(data) {
        total += record.bytes.len();
        std::hint::black_box(record.payload());
    }
    assert!(total <= data.len());
    std::hint::black_box(frame::payloads(data).count());

    if let Ok(list) = std::str::from_utf8(data) {
        std::hint::black_box(list.parse::<AddressFilter>().ok());
    }
});
