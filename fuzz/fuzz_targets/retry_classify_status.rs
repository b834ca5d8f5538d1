#![no_main]

use archiver_retry::{classify_tms_status, Classification};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|status: u16| {
    let err = classify_tms_status(status, "fuzz");
    match status {
        500..=599 => assert_eq!(err.classification, Classification::Transient),
        400..=499 => assert_eq!(err.classification, Classification::Permanent),
        _ => {}
    }
    // `keep_trigger` (§8 invariant 6) must agree with classification
    // regardless of which status range produced it.
    assert_eq!(err.keep_trigger(), err.classification == Classification::Transient);
});
