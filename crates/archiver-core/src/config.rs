//! Layered configuration loading (C14).
//!
//! Precedence, lowest to highest: compiled-in defaults, an optional YAML
//! file at `CONFIG_PATH`, then process environment variables in both a
//! flat (`ARCHIVER_TMS_BASE_URL`) and nested (`ARCHIVER__TMS__BASE_URL`)
//! form, matching the `config` crate's default environment parsing. The
//! loader fails fast on a missing required key or a contradictory
//! hardening flag combination — the process is expected to exit non-zero
//! before binding a socket when this returns `Err`.

use std::path::PathBuf;
use std::time::Duration;

use archiver_types::{ArchiveUserMode, ArticleLimitMode, TagNames};
use serde::{Deserialize, Serialize};

use archiver_types::Secret;

fn default_article_limit() -> u32 {
    500
}

fn default_filename_pattern() -> String {
    "Ticket-{ticket_number}_{timestamp_utc}.pdf".to_string()
}

fn default_call_timeout_secs() -> u64 {
    10
}

fn default_body_limit_bytes() -> u64 {
    1024 * 1024
}

fn default_rate_limit_per_sec() -> u32 {
    5
}

fn default_rate_limit_burst() -> u32 {
    10
}

fn default_delivery_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_concurrency() -> usize {
    8
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

/// TMS connection settings (§3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmsConfig {
    pub base_url: String,
    pub token: Secret<String>,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Allow plaintext (`http://`) base URLs. Off by default per transport
    /// safety (§4.7).
    #[serde(default)]
    pub allow_insecure_transport: bool,
    /// Allow a loopback or link-local TMS host. Off by default.
    #[serde(default)]
    pub allow_loopback: bool,

    #[serde(default)]
    pub field_names: FieldNames,
}

impl TmsConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Field names on the TMS ticket object used to resolve the archive path
/// (§4.1, §9b: `archive_user` is configurable, not hard-coded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldNames {
    #[serde(default = "FieldNames::default_archive_path")]
    pub archive_path: String,
    #[serde(default = "FieldNames::default_archive_user_mode")]
    pub archive_user_mode: String,
    #[serde(default = "FieldNames::default_archive_user")]
    pub archive_user: String,
}

impl FieldNames {
    fn default_archive_path() -> String {
        "archive_path".to_string()
    }
    fn default_archive_user_mode() -> String {
        "archive_user_mode".to_string()
    }
    fn default_archive_user() -> String {
        "archive_user".to_string()
    }
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            archive_path: Self::default_archive_path(),
            archive_user_mode: Self::default_archive_user_mode(),
            archive_user: Self::default_archive_user(),
        }
    }
}

/// Webhook ingress hardening (§4.11, §4.14).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// HMAC secret(s) accepted for `X-Hub-Signature` verification. Any one
    /// matching is sufficient (secret rotation).
    #[serde(default)]
    pub secrets: Vec<Secret<String>>,
    /// Explicit override allowing unsigned webhooks when no secret is
    /// configured. Refused at load time if both this and a secret are set
    /// (ambiguous intent).
    #[serde(default)]
    pub allow_unsigned: bool,
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: u64,
    #[serde(default)]
    pub require_delivery_id: bool,
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    /// Trusted header to read the rate-limit key from instead of the peer
    /// address (e.g. `x-forwarded-for`), for ingress behind a reverse proxy.
    #[serde(default)]
    pub rate_limit_key_header: Option<String>,
    #[serde(default = "default_delivery_ttl_secs")]
    pub delivery_ttl_secs: u64,
}

impl WebhookConfig {
    pub fn delivery_ttl(&self) -> Duration {
        Duration::from_secs(self.delivery_ttl_secs)
    }
}

/// PDF rendering and archival-path policy (§4.1, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub storage_root: PathBuf,
    #[serde(default = "default_filename_pattern")]
    pub filename_pattern: String,
    /// `None` means unrestricted; `Some(&[])` means nothing is allowed
    /// (§4.1).
    #[serde(default)]
    pub prefix_allow_list: Option<Vec<String>>,
    #[serde(default)]
    pub archive_user_mode: ArchiveUserMode,
    /// Used only when `archive_user_mode = fixed`.
    #[serde(default)]
    pub fixed_archive_user: Option<String>,
    #[serde(default = "default_article_limit")]
    pub article_limit: u32,
    #[serde(default)]
    pub article_limit_mode: ArticleLimitMode,
    pub template_variant: String,
}

/// Signing + TSA configuration (§4.9, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfigToggle {
    #[serde(default)]
    pub enabled: bool,
    pub pkcs12_path: Option<PathBuf>,
    pub pkcs12_password: Option<Secret<String>>,
    pub tsa: Option<TsaConfigToggle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsaConfigToggle {
    pub url: String,
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,
    pub basic_auth_username: Option<String>,
    pub basic_auth_password: Option<Secret<String>>,
}

/// Dispatcher concurrency (§4.13).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl DispatchConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// `/healthz` and `/metrics` surface (C16).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    #[serde(default)]
    pub include_version_in_healthz: bool,
    #[serde(default)]
    pub metrics_bearer_token: Option<Secret<String>>,
}

/// Service identity, surfaced in `/healthz` and the audit sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "ServiceConfig::default_name")]
    pub name: String,
}

impl ServiceConfig {
    fn default_name() -> String {
        "ticket-archiver".to_string()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
        }
    }
}

/// The full, immutable configuration snapshot (§3). Loaded once at process
/// start by [`load`]; shared freely behind an `Arc` thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tms: TmsConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub signing: SigningConfigToggle,
    #[serde(default)]
    pub tags: TagNames,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub require_trigger_tag: bool,
    #[serde(default = "Config::default_bind_addr")]
    pub bind_addr: String,
}

impl Config {
    fn default_bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }
}

/// Environment variable that points at an optional YAML config file, read
/// at a precedence below environment variables but above defaults (§6).
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";
/// Prefix for both the flat and nested environment variable forms.
pub const ENV_PREFIX: &str = "ARCHIVER";

/// Errors that abort startup before any socket is bound.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("configuration is invalid: {0}")]
    Invalid(String),
}

/// Loads the configuration snapshot from (ascending precedence) compiled-in
/// defaults, the optional YAML file named by `CONFIG_PATH`, and
/// `ARCHIVER_*` / `ARCHIVER__*__*` environment variables, then validates
/// the required-key and hardening-flag invariants.
pub fn load() -> Result<Config, ConfigError> {
    load_from_env(std::env::vars())
}

/// Testable variant of [`load`] that takes an explicit environment
/// iterator instead of reading the real process environment.
pub fn load_from_env(
    env: impl Iterator<Item = (String, String)>,
) -> Result<Config, ConfigError> {
    let mut builder = ::config::Config::builder();

    let env_map: std::collections::HashMap<String, String> = env.collect();
    if let Some(path) = env_map.get(CONFIG_PATH_ENV) {
        builder = builder.add_source(::config::File::with_name(path).required(true));
    }

    let env_source = ::config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true);
    builder = builder.add_source(env_source);

    let raw = builder.build()?;
    let config: Config = raw.try_deserialize()?;
    validate(&config)?;
    Ok(config)
}

/// Cross-field validation that compiled-in defaults and per-field
/// `#[serde(default)]`s cannot express: required keys, and hardening-flag
/// contradictions (§4.14).
fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.tms.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("tms.base_url is required".to_string()));
    }
    if config.tms.token.expose().trim().is_empty() {
        return Err(ConfigError::Invalid("tms.token is required".to_string()));
    }
    if config.archive.storage_root.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("archive.storage_root is required".to_string()));
    }
    if config.webhook.secrets.is_empty() && !config.webhook.allow_unsigned {
        return Err(ConfigError::Invalid(
            "webhook.secrets is empty; set webhook.allow_unsigned explicitly if this is intended"
                .to_string(),
        ));
    }
    if !config.webhook.secrets.is_empty() && config.webhook.allow_unsigned {
        return Err(ConfigError::Invalid(
            "webhook.allow_unsigned is set but webhook.secrets is also configured; this is a contradictory combination".to_string(),
        ));
    }
    if !config.tms.base_url.starts_with("https://") {
        let is_loopback = is_loopback_url(&config.tms.base_url);
        if is_loopback && !config.tms.allow_loopback {
            return Err(ConfigError::Invalid(
                "tms.base_url is a loopback/link-local host; set tms.allow_loopback to permit it"
                    .to_string(),
            ));
        }
        if !is_loopback && !config.tms.allow_insecure_transport {
            return Err(ConfigError::Invalid(
                "tms.base_url is not https://; set tms.allow_insecure_transport to permit plaintext transport".to_string(),
            ));
        }
    }
    if config.signing.enabled && config.signing.pkcs12_path.is_none() {
        return Err(ConfigError::Invalid(
            "signing.enabled is true but signing.pkcs12_path is not set".to_string(),
        ));
    }
    if config.signing.enabled && config.signing.pkcs12_password.is_none() {
        return Err(ConfigError::Invalid(
            "signing.enabled is true but signing.pkcs12_password is not set".to_string(),
        ));
    }
    if let Some(tsa) = &config.signing.tsa {
        let partial_basic_auth =
            tsa.basic_auth_username.is_some() != tsa.basic_auth_password.is_some();
        if partial_basic_auth {
            return Err(ConfigError::Invalid(
                "signing.tsa basic auth must set both username and password, or neither"
                    .to_string(),
            ));
        }
    }
    Ok(())
}

fn is_loopback_url(url: &str) -> bool {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let host = without_scheme
        .split(['/', ':'])
        .next()
        .unwrap_or(without_scheme);
    host == "localhost" || host == "127.0.0.1" || host == "::1" || host.starts_with("169.254.")
}

/// A redacted view of [`Config`] safe to print in `config check` and
/// structured logs — secret-bearing fields already never print via
/// [`Secret`]'s `Debug` impl, so `{:?}` on the whole struct is already
/// safe; this helper exists for parity with the JSON-facing surfaces that
/// serialise through [`archiver_redact::redact_json`] instead.
pub fn redacted_json(config: &Config) -> serde_json::Value {
    let value = serde_json::to_value(config).unwrap_or(serde_json::Value::Null);
    archiver_redact::redact_json(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> Vec<(String, String)> {
        vec![
            ("ARCHIVER__TMS__BASE_URL".to_string(), "https://tms.example.com".to_string()),
            ("ARCHIVER__TMS__TOKEN".to_string(), "tok-123".to_string()),
            ("ARCHIVER__ARCHIVE__STORAGE_ROOT".to_string(), "/archive".to_string()),
            ("ARCHIVER__ARCHIVE__TEMPLATE_VARIANT".to_string(), "default".to_string()),
            ("ARCHIVER__WEBHOOK__SECRETS".to_string(), "[\"whsec\"]".to_string()),
        ]
    }

    #[test]
    fn loads_minimal_valid_config() {
        let config = load_from_env(base_env().into_iter()).unwrap();
        assert_eq!(config.tms.base_url, "https://tms.example.com");
        assert_eq!(config.archive.article_limit, default_article_limit());
    }

    #[test]
    fn rejects_missing_base_url() {
        let env: Vec<(String, String)> = base_env()
            .into_iter()
            .filter(|(k, _)| k != "ARCHIVER__TMS__BASE_URL")
            .collect();
        assert!(load_from_env(env.into_iter()).is_err());
    }

    #[test]
    fn rejects_secrets_and_allow_unsigned_together() {
        let mut env = base_env();
        env.push(("ARCHIVER__WEBHOOK__ALLOW_UNSIGNED".to_string(), "true".to_string()));
        assert!(load_from_env(env.into_iter()).is_err());
    }

    #[test]
    fn allows_unsigned_when_no_secret_configured() {
        let env: Vec<(String, String)> = base_env()
            .into_iter()
            .filter(|(k, _)| k != "ARCHIVER__WEBHOOK__SECRETS")
            .chain(std::iter::once((
                "ARCHIVER__WEBHOOK__ALLOW_UNSIGNED".to_string(),
                "true".to_string(),
            )))
            .collect();
        assert!(load_from_env(env.into_iter()).is_ok());
    }

    #[test]
    fn rejects_plaintext_tms_without_override() {
        let env: Vec<(String, String)> = base_env()
            .into_iter()
            .map(|(k, v)| {
                if k == "ARCHIVER__TMS__BASE_URL" {
                    (k, "http://tms.example.com".to_string())
                } else {
                    (k, v)
                }
            })
            .collect();
        assert!(load_from_env(env.into_iter()).is_err());
    }

    #[test]
    fn accepts_plaintext_loopback_without_insecure_override() {
        let env: Vec<(String, String)> = base_env()
            .into_iter()
            .map(|(k, v)| {
                if k == "ARCHIVER__TMS__BASE_URL" {
                    (k, "http://127.0.0.1:9200".to_string())
                } else {
                    (k, v)
                }
            })
            .chain(std::iter::once((
                "ARCHIVER__TMS__ALLOW_LOOPBACK".to_string(),
                "true".to_string(),
            )))
            .collect();
        assert!(load_from_env(env.into_iter()).is_ok());
    }

    #[test]
    fn rejects_signing_enabled_without_material() {
        let mut env = base_env();
        env.push(("ARCHIVER__SIGNING__ENABLED".to_string(), "true".to_string()));
        assert!(load_from_env(env.into_iter()).is_err());
    }

    #[test]
    fn redacted_json_never_contains_token() {
        let config = load_from_env(base_env().into_iter()).unwrap();
        let json = redacted_json(&config);
        let rendered = json.to_string();
        assert!(!rendered.contains("tok-123"));
    }
}
