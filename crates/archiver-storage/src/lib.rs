//! Atomic storage writer and audit sidecar builder (C2, C3).
//!
//! [`writer`] owns the symlink-resistant, atomic write protocol for both
//! the rendered PDF and its JSON sidecar; [`audit`] computes the SHA-256
//! and assembles the sidecar record written next to it.

pub mod audit;
pub mod writer;

pub use audit::{build as build_audit_record, sha256_hex, to_json_bytes};
pub use writer::{write_atomic, write_direct, DEFAULT_MODE};

use std::path::{Path, PathBuf};

use archiver_retry::ArchiverError;
use archiver_types::{AuditRecord, ServiceInfo, SigningState, Snapshot};

/// Writes the PDF and its `.json` sidecar atomically, in that order, under
/// the same relative directory. Returns the absolute PDF path and the
/// assembled audit record (already written to disk).
pub fn write_archive(
    root: &Path,
    rel_pdf_path: &Path,
    pdf_bytes: &[u8],
    snapshot: &Snapshot,
    signing: SigningState,
    service: ServiceInfo,
) -> Result<(PathBuf, AuditRecord), ArchiverError> {
    let pdf_path = write_atomic(root, rel_pdf_path, pdf_bytes, true, DEFAULT_MODE)?;

    let storage_path = pdf_path
        .strip_prefix(root)
        .unwrap_or(&pdf_path)
        .to_string_lossy()
        .into_owned();
    let record = build_audit_record(snapshot, &storage_path, pdf_bytes, signing, service);
    let sidecar_bytes = to_json_bytes(&record)
        .map_err(|e| ArchiverError::permanent(archiver_retry::ErrorCode::Storage, format!("failed to serialise sidecar: {e}")))?;

    let sidecar_rel = {
        let mut p = rel_pdf_path.as_os_str().to_owned();
        p.push(".json");
        PathBuf::from(p)
    };
    write_atomic(root, &sidecar_rel, &sidecar_bytes, true, DEFAULT_MODE)?;

    Ok((pdf_path, record))
}
