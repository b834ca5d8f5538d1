//! Ingress, orchestration, and dispatch for the ticket archival service.
//!
//! Module boundaries mirror the component table: [`config`] (C14/C16),
//! [`middleware`] + [`http`] (C11), [`idempotency`] (C4), [`tags`] (C5),
//! [`tms`] (C7), [`snapshot`] (C8), [`renderer`] (the pluggable rendering
//! seam), [`orchestrator`] (C12, the funnel everything else feeds), and
//! [`dispatcher`] (C13). [`jobs`], [`metrics`], and [`logging`] are the
//! ambient observability stack (§9a).

pub mod config;
pub mod dispatcher;
pub mod http;
pub mod idempotency;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod orchestrator;
pub mod renderer;
pub mod snapshot;
pub mod tags;
pub mod ticket_id;
pub mod tms;

pub use dispatcher::{Dispatcher, InProcessDispatcher, ShutdownSignal};
pub use http::{build_router, AppState};
pub use orchestrator::{OrchestratorContext, ProcessOutcome};
