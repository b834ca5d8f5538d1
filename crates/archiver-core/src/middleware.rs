//! Ingress middleware chain (C11).
//!
//! Mounted outermost-first per §4.11: request-id, body-size limit, rate
//! limit, HMAC verify, delivery-id requirement. The pure decision logic
//! (HMAC comparison, request-id resolution, rate-limit admission) is
//! separated from the `axum` wiring so it can be unit-tested directly,
//! the way [`archiver_path_policy`] separates validation from I/O.

use std::num::NonZeroU32;
use std::sync::Arc;

use archiver_types::Secret;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use serde_json::json;

use crate::config::WebhookConfig;

/// Builds the canonical `{detail: <slug>}` error body used across the
/// ingress surface (§7).
pub fn detail_response(status: StatusCode, slug: &str) -> Response {
    (status, Json(json!({ "detail": slug }))).into_response()
}

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const DELIVERY_ID_HEADER: &str = "x-delivery-id";
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

/// Reads `X-Request-Id` from the incoming headers, or mints a fresh UUIDv4
/// if absent or empty (§4.11 step 1).
pub fn resolve_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Verifies a `sha1=<hex>` or `sha256=<hex>` signature header against
/// `body` using any of `secrets` (secret rotation: the first match wins).
/// Comparison is constant-time via `Mac::verify_slice`.
pub fn verify_signature(secrets: &[Secret<String>], signature_header: &str, body: &[u8]) -> bool {
    let Some((algo, hex_digest)) = signature_header.split_once('=') else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    secrets.iter().any(|secret| match algo {
        "sha256" => verify_with::<Hmac<Sha256>>(secret.expose().as_bytes(), body, &expected),
        "sha1" => verify_with::<Hmac<Sha1>>(secret.expose().as_bytes(), body, &expected),
        _ => false,
    })
}

fn verify_with<M: Mac + hmac::digest::KeyInit>(key: &[u8], body: &[u8], expected: &[u8]) -> bool {
    let Ok(mut mac) = M::new_from_slice(key) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(expected).is_ok()
}

/// Outcome of the HMAC-verification decision, used by the `axum` layer to
/// pick a status code (§4.11 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureOutcome {
    Verified,
    /// No secret configured and `allow_unsigned` not set.
    NotConfigured,
    /// Secret(s) configured, but the signature is missing or invalid.
    Invalid,
    /// No secret configured, `allow_unsigned` set: pass through.
    SkippedAllowed,
}

pub fn evaluate_signature(config: &WebhookConfig, headers: &HeaderMap, body: &[u8]) -> SignatureOutcome {
    if config.secrets.is_empty() {
        return if config.allow_unsigned {
            SignatureOutcome::SkippedAllowed
        } else {
            SignatureOutcome::NotConfigured
        };
    }
    match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(header) if verify_signature(&config.secrets, header, body) => SignatureOutcome::Verified,
        _ => SignatureOutcome::Invalid,
    }
}

/// Per-process keyed token-bucket limiter state (§4.11 step 3).
pub struct RateLimiterState {
    limiter: RateLimiter<String, governor::state::keyed::DefaultKeyedStateStore<String>, governor::clock::DefaultClock>,
    key_header: Option<String>,
}

impl RateLimiterState {
    pub fn new(per_sec: u32, burst: u32, key_header: Option<String>) -> Self {
        let per_sec = NonZeroU32::new(per_sec.max(1)).unwrap();
        let burst = NonZeroU32::new(burst.max(1)).unwrap();
        let quota = Quota::per_second(per_sec).allow_burst(burst);
        Self {
            limiter: RateLimiter::keyed(quota),
            key_header,
        }
    }

    /// The rate-limit key for a request: the configured trusted header if
    /// present and configured, otherwise the peer address.
    pub fn key_for(&self, headers: &HeaderMap, peer_addr: &str) -> String {
        if let Some(header_name) = &self.key_header {
            if let Some(value) = headers.get(header_name.as_str()).and_then(|v| v.to_str().ok()) {
                return value.split(',').next().unwrap_or(value).trim().to_string();
            }
        }
        peer_addr.to_string()
    }

    pub fn check(&self, key: &str) -> bool {
        self.limiter.check_key(&key.to_string()).is_ok()
    }
}

/// Shared state the middleware chain closures need; constructed once at
/// startup and threaded through `axum`'s `State` extractor.
#[derive(Clone)]
pub struct IngressState {
    pub webhook: Arc<WebhookConfig>,
    pub rate_limiter: Arc<RateLimiterState>,
}

/// Request-ID middleware: mints or forwards `X-Request-Id`, and stamps it
/// onto the response headers too, so a caller that didn't send one still
/// gets a correlatable id back.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = resolve_request_id(request.headers());
    request
        .extensions_mut()
        .insert(RequestIdExtension(request_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[derive(Clone, Debug)]
pub struct RequestIdExtension(pub String);

/// Rate-limit middleware (§4.11 step 3). Peer address extraction is left to
/// the caller (via `axum::extract::ConnectInfo`); this function takes the
/// already-resolved key.
pub async fn rate_limit_check(state: &RateLimiterState, headers: &HeaderMap, peer_addr: &str) -> Option<Response> {
    let key = state.key_for(headers, peer_addr);
    if state.check(&key) {
        None
    } else {
        Some(detail_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited"))
    }
}

/// HMAC-verify + delivery-id-requirement middleware, applied only on the
/// ingest path (§4.11 steps 4-5). Reads and re-buffers the body so
/// downstream handlers still see it; the body must be fully drained before
/// any `403` is returned (never trust a partial read).
pub async fn verify_ingest_request(
    State(state): State<IngressState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let body_limit = state.webhook.body_limit_bytes as usize;

    let bytes = match to_bytes(body, body_limit).await {
        Ok(bytes) => bytes,
        Err(_) => return detail_response(StatusCode::PAYLOAD_TOO_LARGE, "request_too_large"),
    };

    match evaluate_signature(&state.webhook, &parts.headers, &bytes) {
        SignatureOutcome::Verified | SignatureOutcome::SkippedAllowed => {}
        SignatureOutcome::NotConfigured => {
            return detail_response(StatusCode::SERVICE_UNAVAILABLE, "webhook_auth_not_configured");
        }
        SignatureOutcome::Invalid => {
            return detail_response(StatusCode::FORBIDDEN, "forbidden");
        }
    }

    if state.webhook.require_delivery_id && !parts.headers.contains_key(DELIVERY_ID_HEADER) {
        return detail_response(StatusCode::BAD_REQUEST, "missing_delivery_id");
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    fn sign_sha256(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn resolve_request_id_uses_header_when_present() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-123"));
        assert_eq!(resolve_request_id(&headers), "req-123");
    }

    #[test]
    fn resolve_request_id_mints_when_missing() {
        let headers = HeaderMap::new();
        let id = resolve_request_id(&headers);
        assert!(!id.is_empty());
    }

    #[test]
    fn verify_signature_accepts_matching_sha256() {
        let body = b"hello world";
        let sig = sign_sha256("whsec", body);
        let secrets = vec![Secret::new("whsec".to_string())];
        assert!(verify_signature(&secrets, &sig, body));
    }

    #[test]
    fn verify_signature_rejects_tampered_body() {
        let body = b"hello world";
        let sig = sign_sha256("whsec", body);
        let secrets = vec![Secret::new("whsec".to_string())];
        assert!(!verify_signature(&secrets, &sig, b"hello world!"));
    }

    #[test]
    fn verify_signature_accepts_any_configured_secret_for_rotation() {
        let body = b"payload";
        let sig = sign_sha256("new-secret", body);
        let secrets = vec![Secret::new("old-secret".to_string()), Secret::new("new-secret".to_string())];
        assert!(verify_signature(&secrets, &sig, body));
    }

    #[test]
    fn verify_signature_rejects_unknown_algorithm() {
        let secrets = vec![Secret::new("whsec".to_string())];
        assert!(!verify_signature(&secrets, "md5=deadbeef", b"x"));
    }

    #[test]
    fn evaluate_signature_not_configured_when_no_secret_and_not_allowed() {
        let config = WebhookConfig {
            secrets: vec![],
            allow_unsigned: false,
            body_limit_bytes: 1024,
            require_delivery_id: false,
            rate_limit_per_sec: 5,
            rate_limit_burst: 10,
            rate_limit_key_header: None,
            delivery_ttl_secs: 60,
        };
        let headers = HeaderMap::new();
        assert_eq!(evaluate_signature(&config, &headers, b"x"), SignatureOutcome::NotConfigured);
    }

    #[test]
    fn evaluate_signature_skipped_when_allow_unsigned() {
        let config = WebhookConfig {
            secrets: vec![],
            allow_unsigned: true,
            body_limit_bytes: 1024,
            require_delivery_id: false,
            rate_limit_per_sec: 5,
            rate_limit_burst: 10,
            rate_limit_key_header: None,
            delivery_ttl_secs: 60,
        };
        let headers = HeaderMap::new();
        assert_eq!(evaluate_signature(&config, &headers, b"x"), SignatureOutcome::SkippedAllowed);
    }

    #[test]
    fn rate_limiter_admits_within_burst_then_rejects() {
        let state = RateLimiterState::new(1, 1, None);
        let headers = HeaderMap::new();
        let key = state.key_for(&headers, "127.0.0.1");
        assert!(state.check(&key));
        assert!(!state.check(&key));
    }

    #[test]
    fn rate_limiter_uses_trusted_header_when_configured() {
        let state = RateLimiterState::new(5, 5, Some("x-forwarded-for".to_string()));
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(state.key_for(&headers, "127.0.0.1"), "203.0.113.9");
    }
}
