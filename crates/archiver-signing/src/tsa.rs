//! RFC3161 timestamp authority client (C9).
//!
//! Builds a minimal `TimeStampReq` DER structure by hand — the request
//! shape is small and fixed (version, message imprint, an optional
//! `certReq` flag) so no general ASN.1 dependency is warranted for it —
//! and validates the response down to "plausible DER, right content-type,
//! right status" without fully parsing the embedded CMS token.

use std::time::Duration;

use archiver_retry::{ArchiverError, ErrorCode};
use archiver_types::Secret;

const TIMESTAMP_QUERY_CONTENT_TYPE: &str = "application/timestamp-query";
const TIMESTAMP_REPLY_CONTENT_TYPE: &str = "application/timestamp-reply";

/// SHA-256 OID, DER-encoded: `2.16.840.1.101.3.4.2.1`.
const SHA256_OID_DER: &[u8] = &[
    0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
];

#[derive(Debug, Clone)]
pub struct TsaConfig {
    pub url: String,
    pub timeout: Duration,
    pub basic_auth: Option<TsaBasicAuth>,
}

#[derive(Debug, Clone)]
pub struct TsaBasicAuth {
    pub username: String,
    pub password: Secret<String>,
}

fn der_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else {
        let bytes = len.to_be_bytes();
        let significant: Vec<u8> = bytes.into_iter().skip_while(|b| *b == 0).collect();
        let mut out = vec![0x80 | significant.len() as u8];
        out.extend(significant);
        out
    }
}

fn der_sequence(contents: &[u8]) -> Vec<u8> {
    let mut out = vec![0x30];
    out.extend(der_length(contents.len()));
    out.extend_from_slice(contents);
    out
}

fn der_octet_string(bytes: &[u8]) -> Vec<u8> {
    let mut out = vec![0x04];
    out.extend(der_length(bytes.len()));
    out.extend_from_slice(bytes);
    out
}

fn der_integer_small(value: u8) -> Vec<u8> {
    vec![0x02, 0x01, value]
}

fn der_boolean(value: bool) -> Vec<u8> {
    vec![0x01, 0x01, if value { 0xFF } else { 0x00 }]
}

/// Builds the DER bytes of a `TimeStampReq` over a SHA-256 message
/// imprint, requesting the TSA's signing certificate be included.
pub fn build_timestamp_request(message_imprint_sha256: &[u8; 32]) -> Vec<u8> {
    let algorithm_identifier = der_sequence(SHA256_OID_DER);
    let message_imprint = der_sequence(
        &[algorithm_identifier, der_octet_string(message_imprint_sha256)].concat(),
    );
    let version = der_integer_small(1);
    let cert_req = der_boolean(true);
    der_sequence(&[version, message_imprint, cert_req].concat())
}

/// Very shallow structural check: the response must start with a
/// constructed SEQUENCE tag and its declared length must not overrun the
/// buffer. This is not a full ASN.1 parse; it only rules out obviously
/// garbage or truncated responses before the token is handed to whatever
/// embeds it in the PDF.
fn looks_like_der_sequence(bytes: &[u8]) -> bool {
    if bytes.len() < 2 || bytes[0] != 0x30 {
        return false;
    }
    let first_len_byte = bytes[1];
    if first_len_byte < 0x80 {
        2 + first_len_byte as usize <= bytes.len()
    } else {
        let n_bytes = (first_len_byte & 0x7F) as usize;
        if n_bytes == 0 || 2 + n_bytes > bytes.len() {
            return false;
        }
        let mut len: usize = 0;
        for &b in &bytes[2..2 + n_bytes] {
            len = (len << 8) | b as usize;
        }
        2 + n_bytes + len <= bytes.len()
    }
}

/// Requests a trusted timestamp over `message_imprint_sha256` and returns
/// the raw DER `TimeStampResp` bytes. Timeouts and 5xx status both surface
/// as `Transient{TsaTimeout}`; any other failure to produce a usable token
/// is `Permanent{TsaBadResponse}`. Partial basic-auth configuration
/// (`TsaMisconfigured`) is rejected at startup when the signer is built,
/// not here — by the time a `TsaConfig` reaches this function, its
/// `basic_auth` is already all-or-nothing.
pub async fn stamp(
    client: &reqwest::Client,
    config: &TsaConfig,
    message_imprint_sha256: &[u8; 32],
) -> Result<Vec<u8>, ArchiverError> {
    let body = build_timestamp_request(message_imprint_sha256);
    let mut request = client
        .post(&config.url)
        .timeout(config.timeout)
        .header(reqwest::header::CONTENT_TYPE, TIMESTAMP_QUERY_CONTENT_TYPE)
        .body(body);

    if let Some(auth) = &config.basic_auth {
        request = request.basic_auth(&auth.username, Some(auth.password.expose()));
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ArchiverError::transient(ErrorCode::TsaTimeout, format!("TSA request timed out: {e}"))
        } else {
            ArchiverError::transient(ErrorCode::TsaTimeout, format!("TSA request failed: {e}"))
        }
    })?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(archiver_retry::classify_tsa_status(
            response.status().as_u16(),
            "requesting a timestamp",
        ));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !content_type.starts_with(TIMESTAMP_REPLY_CONTENT_TYPE) {
        return Err(ArchiverError::permanent(
            ErrorCode::TsaBadResponse,
            format!("TSA responded with unexpected content-type {content_type:?}"),
        ));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ArchiverError::permanent(ErrorCode::TsaBadResponse, format!("failed to read TSA response body: {e}")))?;

    if !looks_like_der_sequence(&bytes) {
        return Err(ArchiverError::permanent(
            ErrorCode::TsaBadResponse,
            "TSA response is not a well-formed DER sequence",
        ));
    }

    Ok(bytes.to_vec())
}
