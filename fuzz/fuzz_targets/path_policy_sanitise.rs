#![no_main]

use archiver_path_policy::sanitise_segment;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let once = sanitise_segment(data);
    let twice = sanitise_segment(&once);
    assert_eq!(once, twice, "sanitise_segment is not idempotent for {data:?}");
    assert!(!once.contains('/'));
    assert!(!once.contains('\\'));
    assert!(!once.contains('\0'));
});
