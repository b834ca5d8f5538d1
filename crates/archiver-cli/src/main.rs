//! Binary entrypoint: loads configuration, wires the component graph
//! (§3), and serves the HTTP surface (§6) until a shutdown signal arrives.
//!
//! Startup order matters: configuration first (fail fast on an invalid
//! snapshot before anything else touches the network or disk), then
//! signing material (fail fast per §4.10 rather than at the first signing
//! job), then the component graph, then the listener. Only once the
//! listener is bound do we start accepting webhook traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use archiver_core::config::{self, Config};
use archiver_core::dispatcher::InProcessDispatcher;
use archiver_core::http::{build_router, AppState};
use archiver_core::idempotency::{InFlightSet, InMemoryDeliveryRegistry};
use archiver_core::jobs::JobTable;
use archiver_core::logging;
use archiver_core::metrics::Metrics;
use archiver_core::middleware::{IngressState, RateLimiterState};
use archiver_core::orchestrator::OrchestratorContext;
use archiver_core::renderer::PlainTextRenderer;
use archiver_core::snapshot::TagStrippingSanitizer;
use archiver_core::tms::HttpTmsClient;
use archiver_signing::{Signer, SigningConfig, TsaBasicAuth, TsaConfig};
use archiver_types::ServiceInfo;

const JOB_TABLE_CAPACITY: usize = 10_000;
const DELIVERY_REGISTRY_CAPACITY: usize = 100_000;

/// The ticket-archival ingress and processing service.
///
/// Configuration is read from the environment and an optional YAML file
/// (see `archiver_core::config`). `serve` is the default when no
/// subcommand is given, matching a long-running service's expected
/// invocation with no arguments.
#[derive(Parser, Debug)]
#[command(name = "archiver", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ingress and processing service (default).
    Serve,
    /// Load and validate configuration (and signing material, if
    /// enabled), print the redacted snapshot, and exit without binding
    /// a socket.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Call `POST /retry/{ticket_id}` against a running instance.
    Retry {
        ticket_id: i64,
        /// Base URL of the running instance.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        base_url: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Validate the configuration snapshot.
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Config {
            action: ConfigAction::Check,
        } => config_check(),
        Commands::Retry { ticket_id, base_url } => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?;
            runtime.block_on(retry(ticket_id, &base_url))
        }
        Commands::Serve => {
            let config = config::load().context("failed to load configuration")?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?;
            runtime.block_on(run(config))
        }
    }
}

fn config_check() -> Result<()> {
    let config = config::load().context("failed to load configuration")?;
    let redacted = config::redacted_json(&config);
    println!("{}", serde_json::to_string_pretty(&redacted)?);
    if config.signing.enabled {
        build_signer(&config)?;
    }
    println!("configuration is valid");
    Ok(())
}

/// Thin client for the `retry` subcommand: a single `POST` against a
/// running instance's admin surface, with no configuration loading of
/// its own beyond the target base URL.
async fn retry(ticket_id: i64, base_url: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;
    let url = format!("{}/retry/{}", base_url.trim_end_matches('/'), ticket_id);
    let response = client
        .post(&url)
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("retry request failed: {status} {body}");
    }
    println!("{body}");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let service = ServiceInfo {
        name: config.service.name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        runtime_version: env!("ARCHIVER_RUSTC_VERSION").to_string(),
    };

    let signer = if config.signing.enabled {
        Some(Arc::new(build_signer(&config)?))
    } else {
        None
    };
    let tsa_http_client = if config.signing.tsa.is_some() {
        Some(
            reqwest::Client::builder()
                .no_proxy()
                .build()
                .context("failed to build TSA HTTP client")?,
        )
    } else {
        None
    };

    let tms = Arc::new(HttpTmsClient::new(&config.tms).context("failed to construct TMS client")?);

    let dispatcher = Arc::new(InProcessDispatcher::new(config.dispatch.max_concurrency));
    let shutdown_signal = dispatcher.shutdown_signal();

    let ctx = OrchestratorContext {
        tms,
        renderer: Arc::new(PlainTextRenderer),
        sanitizer: Arc::new(TagStrippingSanitizer::new()),
        signer,
        tsa_http_client,
        in_flight: Arc::new(InFlightSet::new()),
        delivery_registry: Arc::new(InMemoryDeliveryRegistry::new(DELIVERY_REGISTRY_CAPACITY)),
        jobs: Arc::new(JobTable::new(JOB_TABLE_CAPACITY)),
        metrics: Arc::new(Metrics::new()),
        storage_root: config.archive.storage_root.clone(),
        archive: config.archive.clone(),
        tms_field_names: config.tms.field_names.clone(),
        tags: config.tags.clone(),
        require_trigger_tag: config.require_trigger_tag,
        delivery_ttl: config.webhook.delivery_ttl(),
        service,
    };

    let ingress = IngressState {
        webhook: Arc::new(config.webhook.clone()),
        rate_limiter: Arc::new(RateLimiterState::new(
            config.webhook.rate_limit_per_sec,
            config.webhook.rate_limit_burst,
            config.webhook.rate_limit_key_header.clone(),
        )),
    };

    let state = AppState {
        ctx,
        dispatcher: dispatcher.clone(),
        shutdown_signal,
        ingress,
        admin: config.admin.clone(),
    };

    let app = build_router(state);
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind_addr: {}", config.bind_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, service = %config.service.name, "listening");

    let serve = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());
    tokio::select! {
        result = serve => {
            result.context("HTTP server exited unexpectedly")?;
        }
        _ = shutdown_signal_future() => {
            tracing::info!("shutdown signal received; draining in-flight jobs");
            let drained = dispatcher.shutdown(config.dispatch.shutdown_grace()).await;
            if !drained {
                tracing::warn!("shutdown grace period elapsed before all jobs drained");
            }
        }
    }

    Ok(())
}

fn build_signer(config: &Config) -> Result<Signer> {
    let signing = &config.signing;
    let pkcs12_path = signing
        .pkcs12_path
        .clone()
        .context("signing.enabled is true but signing.pkcs12_path is not set")?;
    let pkcs12_password = signing
        .pkcs12_password
        .clone()
        .context("signing.enabled is true but signing.pkcs12_password is not set")?;

    let tsa = match &signing.tsa {
        Some(tsa) => Some(TsaConfig {
            url: tsa.url.clone(),
            timeout: std::time::Duration::from_secs(tsa.timeout_secs),
            basic_auth: match (&tsa.basic_auth_username, &tsa.basic_auth_password) {
                (Some(username), Some(password)) => Some(TsaBasicAuth {
                    username: username.clone(),
                    password: password.clone(),
                }),
                (None, None) => None,
                _ => anyhow::bail!("signing.tsa basic auth must set both username and password, or neither"),
            },
        }),
        None => None,
    };

    let signer = Signer::load(&SigningConfig {
        pkcs12_path,
        pkcs12_password,
        tsa,
    })
    .context("failed to load signing material")?;
    signer
        .check_validity_window()
        .context("signing certificate is not currently valid")?;
    Ok(signer)
}

/// Resolves once the process receives SIGINT (or, on Unix, SIGTERM) —
/// the cooperative trigger for the orchestrator's drain-then-exit path
/// (§4.13, §5).
async fn shutdown_signal_future() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
