#![no_main]

use archiver_redact::redact_json;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let redacted_once = redact_json(&value);
    let redacted_twice = redact_json(&redacted_once);
    assert_eq!(redacted_once, redacted_twice, "redact_json is not idempotent");
});
