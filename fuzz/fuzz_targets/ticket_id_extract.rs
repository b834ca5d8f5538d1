#![no_main]

use archiver_core::ticket_id::extract_ticket_id;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    if let Ok(id) = extract_ticket_id(&value) {
        assert!(id > 0, "extract_ticket_id must reject non-positive ids, got {id}");
    }
});
