#![no_main]

use archiver_redact::redact;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let once = redact(data);
    let twice = redact(&once);
    assert_eq!(once, twice, "redact is not idempotent for {data:?}");
});
