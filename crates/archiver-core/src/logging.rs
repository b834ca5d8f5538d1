//! Structured logging initialisation (C15).
//!
//! JSON-formatted `tracing` events, filterable via `RUST_LOG` (defaulting
//! to `info`). Every pipeline step and middleware decision logs through
//! `tracing`'s macros directly — this module only owns process-wide
//! subscriber setup, mirroring the reference organization's other
//! long-running services (§9a).

use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global `tracing` subscriber. Safe to call once at process
/// start; a second call is a programmer error and panics, matching
/// `tracing`'s own `set_global_default` behaviour.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .with_current_span(true)
        .init();
}

/// Scrubs a message about to be attached to a log event or ticket note
/// through the shared redactor (C17), so secrets never leave the process
/// even when they end up embedded in an error message.
pub fn scrub(message: &str) -> String {
    archiver_redact::redact(message)
}
