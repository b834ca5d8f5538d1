#![no_main]

use archiver_signing::tsa::build_timestamp_request;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|hash: [u8; 32]| {
    let request = build_timestamp_request(&hash);
    // A minimal DER SEQUENCE is always at least a tag+length byte plus the
    // 32-byte hash embedded somewhere inside the request.
    assert!(!request.is_empty());
    assert_eq!(request[0], 0x30, "RFC3161 request must be a DER SEQUENCE");
    let hash_offset = request.windows(hash.len()).position(|w| w == hash);
    assert!(hash_offset.is_some(), "message imprint hash must appear verbatim in the request");
});
