//! Audit sidecar builder (C3).

use archiver_types::{AuditRecord, ServiceInfo, SigningState, Snapshot};
use sha2::{Digest, Sha256};

/// Computes the lowercase-hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Assembles the audit sidecar record for one archived PDF. `storage_path`
/// is the path as it will be recorded (typically relative to the storage
/// root, for portability across mounts).
pub fn build(
    snapshot: &Snapshot,
    storage_path: &str,
    pdf_bytes: &[u8],
    signing: SigningState,
    service: ServiceInfo,
) -> AuditRecord {
    AuditRecord {
        ticket_id: snapshot.id,
        ticket_number: snapshot.number.clone(),
        title: snapshot.title.clone(),
        created_at: snapshot.created_at,
        storage_path: storage_path.to_string(),
        sha256: sha256_hex(pdf_bytes),
        signing,
        service,
        warning: snapshot.truncation_warning.clone(),
    }
}

/// Serialises an [`AuditRecord`] as stable-key-order, UTF-8 JSON with no
/// trailing newline, matching the sidecar's on-disk contract (§6).
pub fn to_json_bytes(record: &AuditRecord) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            id: 1,
            number: "2026070100001".to_string(),
            title: "Test".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            customer: "cust".to_string(),
            owner: "agent".to_string(),
            tags: vec![],
            custom_fields: BTreeMap::new(),
            articles: vec![],
            truncation_warning: None,
        }
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn build_computes_sha256_over_exact_bytes() {
        let snapshot = sample_snapshot();
        let service = ServiceInfo {
            name: "ticket-archiver".to_string(),
            version: "0.1.0".to_string(),
            runtime_version: "rustc 1.92".to_string(),
        };
        let record = build(&snapshot, "acme/ticket.pdf", b"pdf-bytes", SigningState::default(), service);
        assert_eq!(record.sha256, sha256_hex(b"pdf-bytes"));
        assert_eq!(record.sha256.len(), 64);
    }

    #[test]
    fn truncation_warning_is_carried_onto_the_audit_record() {
        let mut snapshot = sample_snapshot();
        snapshot.truncation_warning = Some("truncated from 50 to 20 articles".to_string());
        let service = ServiceInfo {
            name: "ticket-archiver".to_string(),
            version: "0.1.0".to_string(),
            runtime_version: "rustc 1.92".to_string(),
        };
        let record = build(&snapshot, "acme/ticket.pdf", b"data", SigningState::default(), service);
        assert_eq!(record.warning.as_deref(), Some("truncated from 50 to 20 articles"));
    }

    #[test]
    fn no_truncation_means_no_warning() {
        let snapshot = sample_snapshot();
        let service = ServiceInfo {
            name: "ticket-archiver".to_string(),
            version: "0.1.0".to_string(),
            runtime_version: "rustc 1.92".to_string(),
        };
        let record = build(&snapshot, "acme/ticket.pdf", b"data", SigningState::default(), service);
        assert!(record.warning.is_none());
    }

    #[test]
    fn json_round_trips_without_trailing_newline() {
        let snapshot = sample_snapshot();
        let service = ServiceInfo {
            name: "ticket-archiver".to_string(),
            version: "0.1.0".to_string(),
            runtime_version: "rustc 1.92".to_string(),
        };
        let record = build(&snapshot, "acme/ticket.pdf", b"data", SigningState::default(), service);
        let bytes = to_json_bytes(&record).unwrap();
        assert!(!bytes.ends_with(b"\n"));
        let back: AuditRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.sha256, record.sha256);
    }
}
