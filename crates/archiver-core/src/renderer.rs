//! Renderer seam.
//!
//! PDF rendering internals are out of scope for this service (§1) — this
//! module only defines the contract the orchestrator calls through. A real
//! renderer turns a [`Snapshot`] plus a template variant name into PDF
//! bytes containing [`archiver_signing::SIGNATURE_PLACEHOLDER`] at the spot
//! the signer should splice into, when signing is enabled.

use archiver_retry::ArchiverError;
use archiver_types::Snapshot;

/// Renders a ticket snapshot into PDF bytes. Implementations are expected
/// to raise `PermanentError{Render}` on any failure; rendering is not
/// retried by this layer.
pub trait Renderer: Send + Sync {
    fn render(&self, snapshot: &Snapshot, template_variant: &str) -> Result<Vec<u8>, ArchiverError>;
}

/// Minimal built-in renderer: lays the snapshot out as plain text inside a
/// bare PDF container, with the signature placeholder appended at the end.
/// A real HTML→PDF layout engine is an external collaborator per §1; this
/// exists so the service produces something archivable without one.
pub struct PlainTextRenderer;

impl Renderer for PlainTextRenderer {
    fn render(&self, snapshot: &Snapshot, template_variant: &str) -> Result<Vec<u8>, ArchiverError> {
        use std::fmt::Write as _;

        let mut body = String::new();
        let _ = writeln!(body, "Ticket {} ({})", snapshot.number, snapshot.title);
        let _ = writeln!(body, "template: {template_variant}");
        let _ = writeln!(body, "customer: {}  owner: {}", snapshot.customer, snapshot.owner);
        let _ = writeln!(body, "created: {}  updated: {}", snapshot.created_at, snapshot.updated_at);
        for article in &snapshot.articles {
            let _ = writeln!(body, "--- article {} ({}) ---", article.id, article.sender);
            let _ = writeln!(body, "{}", if article.body_html.is_empty() { &article.body_text } else { &article.body_html });
        }

        let mut bytes = format!("%PDF-1.7\n% ticket {}\n", snapshot.number).into_bytes();
        bytes.extend_from_slice(body.as_bytes());
        bytes.extend_from_slice(archiver_signing::SIGNATURE_PLACEHOLDER);
        bytes.extend_from_slice(b"\n%%EOF");
        Ok(bytes)
    }
}

#[cfg(test)]
mod plain_text_renderer_tests {
    use super::*;
    use archiver_types::Snapshot;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn snapshot() -> Snapshot {
        Snapshot {
            id: 1,
            number: "2026070100001".to_string(),
            title: "Printer on fire".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            customer: "acme".to_string(),
            owner: "agent1".to_string(),
            tags: vec![],
            custom_fields: BTreeMap::new(),
            articles: vec![],
            truncation_warning: None,
        }
    }

    #[test]
    fn renders_pdf_container_with_signature_placeholder() {
        let bytes = PlainTextRenderer.render(&snapshot(), "default").unwrap();
        assert!(bytes.starts_with(b"%PDF-1.7"));
        assert!(bytes.ends_with(b"\n%%EOF"));
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("2026070100001"));
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use archiver_signing::SIGNATURE_PLACEHOLDER;

    /// Minimal stand-in renderer for orchestrator tests: produces bytes
    /// that look like a PDF and carry the signature placeholder, without
    /// implementing any real layout.
    pub struct StubRenderer;

    impl Renderer for StubRenderer {
        fn render(&self, snapshot: &Snapshot, _template_variant: &str) -> Result<Vec<u8>, ArchiverError> {
            let mut bytes = format!("%PDF-1.7\n% ticket {}\n", snapshot.number).into_bytes();
            bytes.extend_from_slice(SIGNATURE_PLACEHOLDER);
            bytes.extend_from_slice(b"\n%%EOF");
            Ok(bytes)
        }
    }
}
