#![no_main]

use archiver_path_policy::validate_and_sanitise_segments;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|segments: Vec<String>| {
    if let Ok(sanitised) = validate_and_sanitise_segments(&segments) {
        assert_eq!(sanitised.len(), segments.len());
        assert!(sanitised.len() <= 10);
        for segment in &sanitised {
            assert!(!segment.contains('/'));
            assert!(!segment.contains('\\'));
            assert!(!segment.contains('\0'));
        }
    }
});
