//! Failure classification for the ticket archival pipeline.
//!
//! Every fallible operation in the pipeline (TMS calls, TSA calls, signing,
//! storage, path policy) raises an [`ArchiverError`], which carries a stable
//! [`ErrorCode`] and a [`Classification`]. The processing orchestrator is the
//! single place that reads the classification to decide tag state and retry
//! eligibility — adapters never interpret their own failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a failure should be retried by the next webhook delivery (or an
/// operator-triggered `/retry`), or is final until an operator intervenes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Network blip, timeout, or a 5xx from an external system. Safe to
    /// retry; the trigger tag is kept.
    Transient,
    /// Authorization failure, malformed input, or misconfiguration. Retrying
    /// without operator action would fail identically; the trigger tag is
    /// dropped.
    Permanent,
}

impl Classification {
    /// Whether the trigger tag should be kept on `apply_error` (spec
    /// invariant: `keep_trigger ⇔ classification == Transient`).
    pub fn keep_trigger(self) -> bool {
        matches!(self, Classification::Transient)
    }
}

/// Closed set of error codes surfaced to operators via ticket notes and
/// structured logs. Adding a variant here is a deliberate, reviewed change —
/// operator runbooks key off these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    TmsAuth,
    TmsNotFound,
    TmsServer,
    TmsTimeout,
    Snapshot,
    Render,
    ArticleLimitExceeded,
    SigningMaterial,
    SigningFailed,
    TsaTimeout,
    TsaBadResponse,
    TsaMisconfigured,
    PathPolicy,
    Storage,
    Unknown,
}

impl ErrorCode {
    /// Short operator-facing hint, surfaced in the ticket error note
    /// alongside the code and the (redacted) message.
    pub fn hint(self) -> &'static str {
        match self {
            ErrorCode::TmsAuth => "check the configured TMS token and its permissions",
            ErrorCode::TmsNotFound => "the ticket or a referenced resource no longer exists",
            ErrorCode::TmsServer => "the TMS returned a server error; this will be retried",
            ErrorCode::TmsTimeout => "the TMS did not respond in time; this will be retried",
            ErrorCode::Snapshot => "the ticket payload could not be normalised",
            ErrorCode::Render => "PDF rendering failed",
            ErrorCode::ArticleLimitExceeded => {
                "the ticket has more articles than the configured limit allows"
            }
            ErrorCode::SigningMaterial => "signing is enabled but the PKCS#12 material is missing or invalid",
            ErrorCode::SigningFailed => "applying the PDF signature failed",
            ErrorCode::TsaTimeout => "the timestamp authority did not respond in time; this will be retried",
            ErrorCode::TsaBadResponse => "the timestamp authority returned an unusable response",
            ErrorCode::TsaMisconfigured => "the timestamp authority basic-auth credentials are incomplete",
            ErrorCode::PathPolicy => "the configured archive path failed validation",
            ErrorCode::Storage => "writing the archive to storage failed",
            ErrorCode::Unknown => "an unclassified failure occurred",
        }
    }
}

/// A classified pipeline failure.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ArchiverError {
    pub code: ErrorCode,
    pub classification: Classification,
    pub message: String,
}

impl ArchiverError {
    pub fn transient(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            classification: Classification::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            classification: Classification::Permanent,
            message: message.into(),
        }
    }

    /// Whether `apply_error`'s `keep_trigger` should be set for this failure.
    pub fn keep_trigger(&self) -> bool {
        self.classification.keep_trigger()
    }
}

/// Result of a TMS call classified by status code alone (used when an
/// adapter only has the transport-level outcome and not a richer error).
pub fn classify_tms_status(status: u16, context: &str) -> ArchiverError {
    match status {
        401 | 403 => ArchiverError::permanent(
            ErrorCode::TmsAuth,
            format!("TMS rejected the request ({status}) while {context}"),
        ),
        404 => ArchiverError::permanent(
            ErrorCode::TmsNotFound,
            format!("TMS returned 404 while {context}"),
        ),
        500..=599 => ArchiverError::transient(
            ErrorCode::TmsServer,
            format!("TMS returned {status} while {context}"),
        ),
        _ => ArchiverError::permanent(
            ErrorCode::Unknown,
            format!("TMS returned unexpected status {status} while {context}"),
        ),
    }
}

/// Classifies a TSA response by status code alone, mirroring
/// [`classify_tms_status`]: a 5xx is Transient, everything else short of
/// "200 with the right content-type and a structurally valid token" is
/// Permanent. A transport-level timeout is not a status code at all and is
/// classified directly by callers with [`ArchiverError::transient`] and
/// [`ErrorCode::TsaTimeout`].
pub fn classify_tsa_status(status: u16, context: &str) -> ArchiverError {
    match status {
        500..=599 => ArchiverError::transient(
            ErrorCode::TsaTimeout,
            format!("TSA returned {status} while {context}"),
        ),
        _ => ArchiverError::permanent(
            ErrorCode::TsaBadResponse,
            format!("TSA returned unexpected status {status} while {context}"),
        ),
    }
}

/// Classifies a TSA response that failed the content-type or DER structural
/// checks after the status was already confirmed 200 — always Permanent,
/// since these indicate a malformed reply rather than a transient outage.
pub fn classify_tsa_bad_response(detail: impl Into<String>) -> ArchiverError {
    ArchiverError::permanent(ErrorCode::TsaBadResponse, detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_trigger_matches_classification() {
        assert!(Classification::Transient.keep_trigger());
        assert!(!Classification::Permanent.keep_trigger());
    }

    #[test]
    fn tms_5xx_is_transient() {
        let err = classify_tms_status(503, "fetching ticket");
        assert_eq!(err.classification, Classification::Transient);
        assert_eq!(err.code, ErrorCode::TmsServer);
    }

    #[test]
    fn tms_401_is_permanent_auth() {
        let err = classify_tms_status(401, "fetching ticket");
        assert_eq!(err.classification, Classification::Permanent);
        assert_eq!(err.code, ErrorCode::TmsAuth);
    }

    #[test]
    fn tms_404_is_permanent_not_found() {
        let err = classify_tms_status(404, "fetching ticket");
        assert_eq!(err.classification, Classification::Permanent);
        assert_eq!(err.code, ErrorCode::TmsNotFound);
    }

    #[test]
    fn tms_other_4xx_is_permanent() {
        let err = classify_tms_status(422, "posting note");
        assert_eq!(err.classification, Classification::Permanent);
    }

    #[test]
    fn tsa_5xx_is_transient() {
        let err = classify_tsa_status(503, "requesting a timestamp");
        assert_eq!(err.classification, Classification::Transient);
        assert_eq!(err.code, ErrorCode::TsaTimeout);
    }

    #[test]
    fn tsa_other_status_is_permanent() {
        let err = classify_tsa_status(400, "requesting a timestamp");
        assert_eq!(err.classification, Classification::Permanent);
        assert_eq!(err.code, ErrorCode::TsaBadResponse);
    }

    proptest::proptest! {
        #[test]
        fn every_5xx_is_transient(status in 500u16..600) {
            let err = classify_tms_status(status, "x");
            proptest::prop_assert_eq!(err.classification, Classification::Transient);
        }

        #[test]
        fn every_4xx_other_than_401_403_404_is_permanent(status in 400u16..500) {
            let err = classify_tms_status(status, "x");
            proptest::prop_assert_eq!(err.classification, Classification::Permanent);
        }

        #[test]
        fn every_tsa_5xx_is_transient(status in 500u16..600) {
            let err = classify_tsa_status(status, "x");
            proptest::prop_assert_eq!(err.classification, Classification::Transient);
        }
    }
}
