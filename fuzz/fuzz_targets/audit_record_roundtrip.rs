#![no_main]

use archiver_storage::audit::to_json_bytes;
use archiver_types::AuditRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(record) = serde_json::from_slice::<AuditRecord>(data) else {
        return;
    };
    let Ok(bytes) = to_json_bytes(&record) else {
        return;
    };
    assert!(!bytes.ends_with(b"\n"));
    let reparsed: AuditRecord = serde_json::from_slice(&bytes).expect("sidecar bytes must re-parse");
    assert_eq!(
        serde_json::to_value(&record).unwrap(),
        serde_json::to_value(&reparsed).unwrap()
    );
});
