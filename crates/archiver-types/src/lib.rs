//! # Types
//!
//! Core domain types shared by every crate in the ticket archival service:
//! the normalised ticket [`Snapshot`] handed to the renderer, the
//! [`AuditRecord`] sidecar written next to each PDF, the [`TagNames`] and
//! [`ArticleLimitMode`] configuration enums, and the [`Secret`] newtype that
//! keeps credential material out of `Debug`/`Display` output.
//!
//! ## Serialization
//!
//! Types that cross a process boundary (the audit sidecar, the snapshot)
//! implement `Serialize`/`Deserialize` from `serde` with stable field
//! ordering, since the audit sidecar's byte-for-byte JSON output is part of
//! its contract (see [`AuditRecord`]).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wraps a credential or other secret so that `{:?}` and `{}` never print
/// the value, even transitively through a containing struct's derived
/// `Debug`. The value is still reachable via [`Secret::expose`] for the one
/// or two call sites that must actually use it (building an auth header,
/// opening a PKCS#12 file).
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret<T = String>(T);

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Returns the wrapped value. Callers must not pass the result to a
    /// logger, a `Debug` format, or a ticket note.
    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl<T> PartialEq for Secret<T>
where
    T: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

/// Configurable names of the four ticket-side state tags (§4.5). Defaults
/// match the reference TMS convention (`pdf:sign`, `pdf:processing`,
/// `pdf:done`, `pdf:error`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagNames {
    pub trigger: String,
    pub processing: String,
    pub done: String,
    pub error: String,
    /// Marker tag added alongside `done` when signing actually occurred.
    pub signed: String,
}

impl Default for TagNames {
    fn default() -> Self {
        Self {
            trigger: "pdf:sign".to_string(),
            processing: "pdf:processing".to_string(),
            done: "pdf:done".to_string(),
            error: "pdf:error".to_string(),
            signed: "pdf:signed".to_string(),
        }
    }
}

/// How the snapshot builder handles a ticket whose article count exceeds
/// `article_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleLimitMode {
    /// Reject the ticket with `ArticleLimitExceeded`.
    #[default]
    Fail,
    /// Truncate to the limit, recording a warning on the audit record.
    CapAndContinue,
}

/// Which ticket field supplies the per-archive "owner" path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveUserMode {
    /// Use the ticket's configured owner field.
    #[default]
    Owner,
    /// Use the identity of the agent currently processing the ticket.
    CurrentAgent,
    /// Use a single fixed value from configuration.
    Fixed,
}

/// Metadata-only record of an attachment on an [`Article`]. Bytes are never
/// fetched by this service; only the reference survives into the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub id: i64,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// One article (reply, note, or customer message) on a ticket, normalised
/// by the snapshot builder (C8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub internal: bool,
    pub sender: String,
    pub subject: String,
    /// Sanitised HTML body. Empty when the sanitiser stripped everything;
    /// the renderer falls back to `body_text` in that case.
    pub body_html: String,
    pub body_text: String,
    pub attachments: Vec<AttachmentMeta>,
}

/// The normalised, render-ready projection of a ticket plus its tags and
/// articles (C8 output, §3). Articles are sorted by `(created_at asc, id
/// asc)` by the builder; this type does not re-sort on construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub number: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub customer: String,
    pub owner: String,
    pub tags: Vec<String>,
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    pub articles: Vec<Article>,
    /// Set by the snapshot builder when `cap_and_continue` truncated the
    /// article list; surfaced on the audit record.
    pub truncation_warning: Option<String>,
}

impl Snapshot {
    /// Reads a named custom field as a string, used to resolve the
    /// configurable `archive_path` field (§4.1).
    pub fn custom_field_str(&self, field: &str) -> Option<&str> {
        self.custom_fields.get(field).and_then(|v| v.as_str())
    }
}

/// Whether and how a PDF was signed, recorded on the audit sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningState {
    pub enabled: bool,
    pub tsa_used: bool,
    /// Lowercase hex SHA-256 of the DER-encoded signer certificate, present
    /// only when `enabled` is true.
    pub cert_fingerprint: Option<String>,
}

/// Identifies this service in the audit sidecar and `/healthz` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub runtime_version: String,
}

/// The JSON sidecar record written next to every archived PDF (C3, §3).
/// Field order here is the serialised key order — it is part of the
/// sidecar's stability contract and must not be reordered casually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ticket_id: i64,
    pub ticket_number: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub storage_path: String,
    pub sha256: String,
    pub signing: SigningState,
    pub service: ServiceInfo,
    /// Carried over from [`Snapshot::truncation_warning`] when
    /// `cap_and_continue` truncated the article list (§4.8).
    pub warning: Option<String>,
}
