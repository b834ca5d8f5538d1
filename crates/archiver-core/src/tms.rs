//! TMS REST client (C7).
//!
//! All six operations the orchestrator needs, each with its own per-call
//! timeout. An adapter never retries or interprets its own failures — it
//! raises an [`ArchiverError`] (classified by [`archiver_retry`]) and lets
//! C12 decide. Transport safety is enforced once, at construction, per
//! §4.7.

use std::time::Duration;

use archiver_retry::{classify_tms_status, ArchiverError, ErrorCode};
use archiver_types::Secret;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::TmsConfig;

/// Raw ticket payload as returned by the TMS, before snapshot
/// normalisation (C8 consumes this).
#[derive(Debug, Clone, Deserialize)]
pub struct RawTicket {
    pub id: i64,
    pub number: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub customer: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAttachment {
    pub id: i64,
    pub filename: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawArticle {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_html: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub attachments: Vec<RawAttachment>,
}

/// The two historical tag-payload shapes the TMS has shipped, both of
/// which must decode (§4.7): a bare array of names, or an array of
/// `{name: ...}` objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTagsPayload {
    Bare(Vec<String>),
    Objects(Vec<RawTagObject>),
}

#[derive(Debug, Clone, Deserialize)]
struct RawTagObject {
    name: String,
}

fn decode_tags(payload: RawTagsPayload) -> Vec<String> {
    match payload {
        RawTagsPayload::Bare(names) => names,
        RawTagsPayload::Objects(objs) => objs.into_iter().map(|o| o.name).collect(),
    }
}

/// The six operations the orchestrator calls against the TMS (§4.7).
#[async_trait]
pub trait TmsClient: Send + Sync {
    async fn get_ticket(&self, id: i64) -> Result<RawTicket, ArchiverError>;
    async fn list_tags(&self, id: i64) -> Result<Vec<String>, ArchiverError>;
    async fn list_articles(&self, id: i64) -> Result<Vec<RawArticle>, ArchiverError>;
    async fn add_tag(&self, id: i64, name: &str) -> Result<(), ArchiverError>;
    async fn remove_tag(&self, id: i64, name: &str) -> Result<(), ArchiverError>;
    async fn create_internal_note(&self, id: i64, body_html: &str) -> Result<(), ArchiverError>;
}

/// `reqwest`-backed implementation. Transport safety checks (§4.7) run
/// once, here, at construction.
pub struct HttpTmsClient {
    client: reqwest::Client,
    base_url: String,
    token: Secret<String>,
    timeout: Duration,
}

impl HttpTmsClient {
    pub fn new(config: &TmsConfig) -> Result<Self, ArchiverError> {
        validate_transport_safety(config)?;
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout())
            .no_proxy()
            .build()
            .map_err(|e| ArchiverError::permanent(ErrorCode::Unknown, format!("failed to build TMS HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            timeout: config.call_timeout(),
        })
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token.expose())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<reqwest::Response, ArchiverError> {
        let response = request
            .timeout(self.timeout)
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ArchiverError::transient(ErrorCode::TmsTimeout, format!("TMS call timed out while {context}"))
                } else {
                    ArchiverError::transient(ErrorCode::TmsTimeout, format!("TMS call failed while {context}: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(classify_tms_status(response.status().as_u16(), context));
        }
        Ok(response)
    }
}

fn validate_transport_safety(config: &TmsConfig) -> Result<(), ArchiverError> {
    let is_https = config.base_url.starts_with("https://");
    let is_loopback = is_loopback_host(&config.base_url);
    if !is_https && !is_loopback && !config.allow_insecure_transport {
        return Err(ArchiverError::permanent(
            ErrorCode::Unknown,
            "TMS base URL uses plaintext transport without allow_insecure_transport".to_string(),
        ));
    }
    if is_loopback && !config.allow_loopback {
        return Err(ArchiverError::permanent(
            ErrorCode::Unknown,
            "TMS base URL targets a loopback/link-local host without allow_loopback".to_string(),
        ));
    }
    Ok(())
}

fn is_loopback_host(url: &str) -> bool {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let host = without_scheme.split(['/', ':']).next().unwrap_or(without_scheme);
    host == "localhost" || host == "127.0.0.1" || host == "::1" || host.starts_with("169.254.")
}

#[async_trait]
impl TmsClient for HttpTmsClient {
    async fn get_ticket(&self, id: i64) -> Result<RawTicket, ArchiverError> {
        let response = self
            .send(self.client.get(self.url(&format!("/api/v1/tickets/{id}"))), "fetching ticket")
            .await?;
        response
            .json::<RawTicket>()
            .await
            .map_err(|e| ArchiverError::permanent(archiver_retry::ErrorCode::Snapshot, format!("failed to decode ticket payload: {e}")))
    }

    async fn list_tags(&self, id: i64) -> Result<Vec<String>, ArchiverError> {
        let response = self
            .send(self.client.get(self.url(&format!("/api/v1/tickets/{id}/tags"))), "listing tags")
            .await?;
        let payload = response
            .json::<RawTagsPayload>()
            .await
            .map_err(|e| ArchiverError::permanent(archiver_retry::ErrorCode::Snapshot, format!("failed to decode tags payload: {e}")))?;
        Ok(decode_tags(payload))
    }

    async fn list_articles(&self, id: i64) -> Result<Vec<RawArticle>, ArchiverError> {
        let response = self
            .send(self.client.get(self.url(&format!("/api/v1/tickets/{id}/articles"))), "listing articles")
            .await?;
        response
            .json::<Vec<RawArticle>>()
            .await
            .map_err(|e| ArchiverError::permanent(archiver_retry::ErrorCode::Snapshot, format!("failed to decode articles payload: {e}")))
    }

    async fn add_tag(&self, id: i64, name: &str) -> Result<(), ArchiverError> {
        self.send(
            self.client
                .post(self.url(&format!("/api/v1/tickets/{id}/tags")))
                .json(&serde_json::json!({ "name": name })),
            "adding tag",
        )
        .await?;
        Ok(())
    }

    async fn remove_tag(&self, id: i64, name: &str) -> Result<(), ArchiverError> {
        self.send(
            self.client.delete(self.url(&format!("/api/v1/tickets/{id}/tags/{name}"))),
            "removing tag",
        )
        .await?;
        Ok(())
    }

    async fn create_internal_note(&self, id: i64, body_html: &str) -> Result<(), ArchiverError> {
        self.send(
            self.client
                .post(self.url(&format!("/api/v1/tickets/{id}/articles")))
                .json(&serde_json::json!({ "internal": true, "body_html": body_html })),
            "posting internal note",
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> TmsConfig {
        TmsConfig {
            base_url: base_url.to_string(),
            token: Secret::new("tok".to_string()),
            call_timeout_secs: 10,
            allow_insecure_transport: false,
            allow_loopback: false,
            field_names: crate::config::FieldNames::default(),
        }
    }

    #[test]
    fn decode_tags_accepts_bare_array_shape() {
        let payload: RawTagsPayload = serde_json::from_str(r#"["pdf:sign", "vip"]"#).unwrap();
        assert_eq!(decode_tags(payload), vec!["pdf:sign".to_string(), "vip".to_string()]);
    }

    #[test]
    fn decode_tags_accepts_object_array_shape() {
        let payload: RawTagsPayload =
            serde_json::from_str(r#"[{"name": "pdf:sign"}, {"name": "vip"}]"#).unwrap();
        assert_eq!(decode_tags(payload), vec!["pdf:sign".to_string(), "vip".to_string()]);
    }

    #[test]
    fn rejects_plaintext_non_loopback_without_override() {
        let err = HttpTmsClient::new(&config("http://tms.example.com")).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unknown);
    }

    #[test]
    fn rejects_loopback_without_override() {
        let mut cfg = config("http://127.0.0.1:9000");
        cfg.allow_insecure_transport = true;
        let err = HttpTmsClient::new(&cfg).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unknown);
    }

    #[test]
    fn accepts_https_by_default() {
        assert!(HttpTmsClient::new(&config("https://tms.example.com")).is_ok());
    }

    #[test]
    fn accepts_loopback_with_explicit_override() {
        let mut cfg = config("http://127.0.0.1:9000");
        cfg.allow_loopback = true;
        cfg.allow_insecure_transport = true;
        assert!(HttpTmsClient::new(&cfg).is_ok());
    }
}
