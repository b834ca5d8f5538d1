//! HTTP surface (§6) — the `axum` wiring around [`crate::middleware`] and
//! [`crate::orchestrator`].
//!
//! Mounted in the order §4.11 mandates: request-id (outermost), then
//! rate-limit, then — on the two ingest routes only — body-size/HMAC/
//! delivery-id. `/retry`, `/jobs`, `/healthz`, and `/metrics` are
//! administrative or polling surfaces and are not webhook endpoints, so
//! they are not subject to HMAC or delivery-id requirements (§4.11: "beyond
//! `/ingest` ... bypass HMAC and delivery-ID but remain subject to earlier
//! middleware").

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::config::AdminConfig;
use crate::dispatcher::{DispatchError, Dispatcher, ShutdownSignal};
use crate::middleware::{
    detail_response, rate_limit_check, request_id_middleware, verify_ingest_request, IngressState,
    RequestIdExtension, DELIVERY_ID_HEADER,
};
use crate::orchestrator::{process_ticket, OrchestratorContext};
use crate::ticket_id::extract_ticket_id;

/// Everything an HTTP handler needs, beyond the ingress-only middleware
/// state: the orchestrator context, the dispatcher jobs are submitted
/// through, and the admin-surface configuration.
#[derive(Clone)]
pub struct AppState {
    pub ctx: OrchestratorContext,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub shutdown_signal: ShutdownSignal,
    pub ingress: IngressState,
    pub admin: AdminConfig,
}

/// Builds the full router. Served with
/// `axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())`
/// so the rate limiter can read the peer address.
pub fn build_router(state: AppState) -> Router {
    let ingest_routes = Router::new()
        .route("/ingest", post(ingest_handler))
        .route("/ingest/batch", post(ingest_batch_handler))
        .route_layer(middleware::from_fn_with_state(state.ingress.clone(), verify_ingest_request));

    let admin_routes = Router::new()
        .route("/retry/{ticket_id}", post(retry_handler))
        .route("/jobs/{ticket_id}", get(jobs_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    Router::new()
        .merge(ingest_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Rate-limit middleware wiring (§4.11 step 3): resolves the limiter key
/// from the configured trusted header or the connected peer, then defers
/// the admission decision to [`rate_limit_check`].
async fn rate_limit_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let peer = addr.ip().to_string();
    if let Some(rejected) = rate_limit_check(&state.ingress.rate_limiter, request.headers(), &peer).await {
        return rejected;
    }
    next.run(request).await
}

fn request_id_from(request_ext: Option<&axum::Extension<RequestIdExtension>>) -> String {
    request_ext
        .map(|ext| ext.0.0.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn schedule_job(
    state: &AppState,
    ticket_id: i64,
    delivery_id: Option<String>,
    request_id: String,
) -> Result<(), DispatchError> {
    let ctx = state.ctx.clone();
    let shutdown = state.shutdown_signal.clone();
    state
        .dispatcher
        .submit(Box::pin(async move {
            let _ = process_ticket(ctx, ticket_id, delivery_id, request_id, shutdown).await;
        }))
        .await
}

fn unprocessable(slug: &str) -> Response {
    detail_response(StatusCode::UNPROCESSABLE_ENTITY, slug)
}

async fn ingest_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    request_ext: Option<axum::Extension<RequestIdExtension>>,
    body: axum::body::Bytes,
) -> Response {
    let request_id = request_id_from(request_ext.as_ref());
    let delivery_id = headers
        .get(DELIVERY_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return unprocessable("invalid_json"),
    };
    let ticket_id = match extract_ticket_id(&value) {
        Ok(id) => id,
        Err(_) => return unprocessable("invalid_ticket_id"),
    };

    match schedule_job(&state, ticket_id, delivery_id, request_id).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"accepted": true, "ticket_id": ticket_id}))).into_response(),
        Err(DispatchError::Unavailable) => detail_response(StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
    }
}

async fn ingest_batch_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    request_ext: Option<axum::Extension<RequestIdExtension>>,
    body: axum::body::Bytes,
) -> Response {
    if state.dispatcher.is_shutting_down() {
        return detail_response(StatusCode::SERVICE_UNAVAILABLE, "shutting_down");
    }

    let request_id = request_id_from(request_ext.as_ref());
    let delivery_id = headers
        .get(DELIVERY_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let items: Vec<Value> = match serde_json::from_slice(&body) {
        Ok(Value::Array(items)) => items,
        _ => return unprocessable("invalid_json"),
    };

    let mut count = 0u64;
    for item in items {
        let Ok(ticket_id) = extract_ticket_id(&item) else {
            tracing::warn!("skipping batch item with invalid or missing ticket id");
            continue;
        };
        match schedule_job(&state, ticket_id, delivery_id.clone(), request_id.clone()).await {
            Ok(()) => count += 1,
            Err(DispatchError::Unavailable) => break,
        }
    }

    (StatusCode::ACCEPTED, Json(json!({"accepted": true, "count": count}))).into_response()
}

async fn retry_handler(
    State(state): State<AppState>,
    Path(ticket_id): Path<i64>,
    request_ext: Option<axum::Extension<RequestIdExtension>>,
) -> Response {
    if ticket_id <= 0 {
        return unprocessable("invalid_ticket_id");
    }
    let request_id = request_id_from(request_ext.as_ref());
    // Bypasses delivery-id dedup entirely (§6): no delivery id is claimed.
    match schedule_job(&state, ticket_id, None, request_id).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"accepted": true, "ticket_id": ticket_id}))).into_response(),
        Err(DispatchError::Unavailable) => detail_response(StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
    }
}

async fn jobs_handler(State(state): State<AppState>, Path(ticket_id): Path<i64>) -> Response {
    Json(json!({
        "ticket_id": ticket_id,
        "in_flight": state.ctx.in_flight.is_in_flight(ticket_id),
        "shutting_down": state.dispatcher.is_shutting_down(),
    }))
    .into_response()
}

async fn healthz_handler(State(state): State<AppState>) -> Response {
    let mut body = json!({
        "status": "ok",
        "service": state.ctx.service.name,
        "time": crate::jobs::now_utc().to_rfc3339(),
    });
    if state.admin.include_version_in_healthz {
        body["version"] = json!(state.ctx.service.version);
    }
    Json(body).into_response()
}

async fn metrics_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = &state.admin.metrics_bearer_token {
        let provided = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if provided != Some(token.expose().as_str()) {
            return detail_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }
    state.ctx.metrics.render().into_response()
}
