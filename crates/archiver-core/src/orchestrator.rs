//! Processing orchestrator (C12).
//!
//! Drives the fourteen-step pipeline in §4.12, in the exact order given
//! there: lock before claim before eligibility, success note before the
//! `DONE` transition. Every fallible step funnels into one catch-all that
//! classifies the failure (C6), posts an error note, repairs tags, and
//! releases the lock — the single place failure policy is decided; no
//! adapter module writes a note or a tag itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use archiver_retry::{ArchiverError, ErrorCode};
use archiver_types::{ServiceInfo, SigningState, TagNames};
use tracing::{error, info, warn};

use crate::config::{ArchiveConfig, FieldNames};
use crate::dispatcher::ShutdownSignal;
use crate::idempotency::{AcquireOutcome, ClaimOutcome, DeliveryRegistry, InFlightSet};
use crate::jobs::{now_utc, JobRecord, JobTable, Phase};
use crate::metrics::Metrics;
use crate::renderer::Renderer;
use crate::snapshot::{build_snapshot, HtmlSanitizer};
use crate::tags;
use crate::tms::TmsClient;

/// Everything a job needs for the lifetime of one ticket's processing.
/// Cloned cheaply (every field is an `Arc` or `Copy`); constructed once at
/// startup and shared across every job.
#[derive(Clone)]
pub struct OrchestratorContext {
    pub tms: Arc<dyn TmsClient>,
    pub renderer: Arc<dyn Renderer>,
    pub sanitizer: Arc<dyn HtmlSanitizer>,
    pub signer: Option<Arc<archiver_signing::Signer>>,
    pub tsa_http_client: Option<reqwest::Client>,
    pub in_flight: Arc<InFlightSet>,
    pub delivery_registry: Arc<dyn DeliveryRegistry>,
    pub jobs: Arc<JobTable>,
    pub metrics: Arc<Metrics>,
    pub storage_root: PathBuf,
    pub archive: ArchiveConfig,
    pub tms_field_names: FieldNames,
    pub tags: TagNames,
    pub require_trigger_tag: bool,
    pub delivery_ttl: std::time::Duration,
    pub service: ServiceInfo,
}

/// What happened to one submitted job, for logging and metrics at the
/// dispatcher boundary.
#[derive(Debug)]
pub enum ProcessOutcome {
    Archived,
    SkippedInFlight,
    SkippedDuplicateDelivery,
    SkippedNotEligible,
    Failed(ArchiverError),
    Cancelled,
}

/// Runs the full pipeline for one ticket. The in-flight lock is acquired
/// before the pipeline races against `shutdown`, so whichever branch wins —
/// normal completion or forced cancellation — the same guard is on hand to
/// release it and, on cancellation, to run the same tag-repair path a
/// classified failure would (§5: "forced cancellation ... unwinds through
/// the same failure path as errors").
pub async fn process_ticket(
    ctx: OrchestratorContext,
    ticket_id: i64,
    delivery_id: Option<String>,
    request_id: String,
    mut shutdown: ShutdownSignal,
) -> ProcessOutcome {
    let started = Instant::now();
    ctx.metrics.job_started();

    let outcome = run_pipeline(&ctx, ticket_id, delivery_id.clone(), request_id.clone(), &mut shutdown).await;

    let outcome_label = match &outcome {
        ProcessOutcome::Archived => "archived",
        ProcessOutcome::SkippedInFlight => "skipped_in_flight",
        ProcessOutcome::SkippedDuplicateDelivery => "skipped_duplicate_delivery",
        ProcessOutcome::SkippedNotEligible => "skipped_not_eligible",
        ProcessOutcome::Failed(_) => "failed",
        ProcessOutcome::Cancelled => "cancelled",
    };
    ctx.metrics.record_job_outcome(outcome_label);
    ctx.metrics.job_finished(started.elapsed().as_secs_f64());
    outcome
}

async fn run_pipeline(
    ctx: &OrchestratorContext,
    ticket_id: i64,
    delivery_id: Option<String>,
    request_id: String,
    shutdown: &mut ShutdownSignal,
) -> ProcessOutcome {
    // Step 3: acquire the in-flight lock before touching the delivery
    // registry, so a busy ticket never poisons a fresh delivery id (§4.12
    // step 4, §9b).
    let guard = match ctx.in_flight.try_acquire(ticket_id) {
        AcquireOutcome::Acquired(guard) => guard,
        AcquireOutcome::Busy => {
            record_phase(ctx, ticket_id, &delivery_id, &request_id, Phase::Skipped, false);
            info!(ticket_id, "skipping ticket: already in flight");
            return ProcessOutcome::SkippedInFlight;
        }
    };

    // Step 4: claim the delivery id, now that the lock is held.
    if let Some(id) = &delivery_id {
        let claim = ctx.delivery_registry.claim(id, Instant::now(), ctx.delivery_ttl);
        if claim == ClaimOutcome::Duplicate {
            ctx.metrics.record_delivery_duplicate();
            guard.release().await;
            record_phase(ctx, ticket_id, &delivery_id, &request_id, Phase::Skipped, false);
            info!(ticket_id, delivery_id = id.as_str(), "skipping duplicate delivery");
            return ProcessOutcome::SkippedDuplicateDelivery;
        }
    }

    let raced = tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        result = process_locked(ctx, ticket_id, &delivery_id, &request_id) => Some(result),
    };

    match raced {
        None => {
            warn!(ticket_id, "processing cancelled by shutdown; repairing tags and releasing lock");
            let note = cancellation_note(&delivery_id, &request_id);
            if let Err(e) = ctx.tms.create_internal_note(ticket_id, &note).await {
                warn!(ticket_id, error = %e, "failed to post cancellation note");
            }
            // Keep the trigger tag so the next delivery (or an operator
            // retry) can pick the ticket back up; a cancellation is not a
            // verdict on the ticket itself.
            let transition = tags::apply_error(&ctx.tags, true);
            if let Err(e) = apply_transition(ctx, ticket_id, &transition).await {
                error!(ticket_id, error = %e, "failed to repair tags after cancellation");
            }
            guard.release().await;
            record_phase(ctx, ticket_id, &delivery_id, &request_id, Phase::Failed, false);
            ProcessOutcome::Cancelled
        }
        Some(Ok(Outcome::NotEligible)) => {
            guard.release().await;
            record_phase(ctx, ticket_id, &delivery_id, &request_id, Phase::Skipped, false);
            ProcessOutcome::SkippedNotEligible
        }
        Some(Ok(Outcome::Archived)) => {
            guard.release().await;
            record_phase(ctx, ticket_id, &delivery_id, &request_id, Phase::ReleasingLock, false);
            ProcessOutcome::Archived
        }
        Some(Err(failure)) => {
            handle_failure(ctx, ticket_id, &delivery_id, &request_id, &failure).await;
            guard.release().await;
            record_phase(ctx, ticket_id, &delivery_id, &request_id, Phase::Failed, false);
            ProcessOutcome::Failed(failure)
        }
    }
}

enum Outcome {
    NotEligible,
    Archived,
}

fn cancellation_note(delivery_id: &Option<String>, request_id: &str) -> String {
    format!(
        "Ticket archival was interrupted by a service shutdown and will be retried on the next delivery.\nRequest id: {}\nDelivery id: {}\nTimestamp (UTC): {}",
        escape_html(request_id),
        escape_html(delivery_id.as_deref().unwrap_or("")),
        now_utc().to_rfc3339(),
    )
}

async fn process_locked(
    ctx: &OrchestratorContext,
    ticket_id: i64,
    delivery_id: &Option<String>,
    request_id: &str,
) -> Result<Outcome, ArchiverError> {
    // Step 5: fetch tags and evaluate eligibility.
    record_phase(ctx, ticket_id, delivery_id, request_id, Phase::EvaluatingEligibility, true);
    let current_tags: std::collections::HashSet<String> =
        ctx.tms.list_tags(ticket_id).await?.into_iter().collect();
    if !tags::should_process(&current_tags, &ctx.tags, ctx.require_trigger_tag) {
        return Ok(Outcome::NotEligible);
    }

    // Step 6: transition to PROCESSING.
    record_phase(ctx, ticket_id, delivery_id, request_id, Phase::TransitioningToProcessing, true);
    apply_transition(ctx, ticket_id, &tags::apply_processing(&ctx.tags)).await?;

    // Step 7: fetch ticket + articles, build snapshot.
    record_phase(ctx, ticket_id, delivery_id, request_id, Phase::FetchingSnapshot, true);
    let ticket = ctx.tms.get_ticket(ticket_id).await?;
    let articles = ctx.tms.list_articles(ticket_id).await?;
    let tag_list: Vec<String> = current_tags.into_iter().collect();
    let snapshot = build_snapshot(
        ticket,
        tag_list,
        articles,
        ctx.sanitizer.as_ref(),
        ctx.archive.article_limit,
        ctx.archive.article_limit_mode,
    )?;

    // Step 8: render.
    record_phase(ctx, ticket_id, delivery_id, request_id, Phase::Rendering, true);
    let rendered = ctx.renderer.render(&snapshot, &ctx.archive.template_variant)?;

    // Step 9: sign + timestamp, if configured.
    record_phase(ctx, ticket_id, delivery_id, request_id, Phase::Signing, true);
    let (pdf_bytes, signing_state) = sign_if_configured(ctx, rendered).await?;

    // Step 10: resolve archive path and write the PDF.
    record_phase(ctx, ticket_id, delivery_id, request_id, Phase::WritingArchive, true);
    let rel_path = resolve_archive_path(ctx, &snapshot)?;

    // Step 11: build + write the audit sidecar.
    record_phase(ctx, ticket_id, delivery_id, request_id, Phase::WritingAudit, true);
    let (pdf_path, audit) = archiver_storage::write_archive(
        &ctx.storage_root,
        &rel_path,
        &pdf_bytes,
        &snapshot,
        signing_state,
        ctx.service.clone(),
    )?;

    // Step 12: post the success note.
    record_phase(ctx, ticket_id, delivery_id, request_id, Phase::PostingSuccessNote, true);
    let note = render_success_note(&audit, &pdf_path, delivery_id, request_id);
    ctx.tms.create_internal_note(ticket_id, &note).await?;

    // Step 13: transition to DONE (plus the `signed` marker when signing
    // actually occurred, per the §4.5 expansion).
    record_phase(ctx, ticket_id, delivery_id, request_id, Phase::TransitioningToDone, true);
    let done_transition = tags::apply_done(&ctx.tags, audit.signing.enabled);
    if let Err(err) = apply_transition(ctx, ticket_id, &done_transition).await {
        // Cleanup robustness (§4.12): the archive and note already
        // succeeded; a best-effort repair removes at least PROCESSING so
        // the ticket isn't stuck looking untouched, and the failure is
        // logged explicitly rather than swallowed.
        error!(ticket_id, error = %err, "final DONE tag transition failed after successful archive; attempting PROCESSING cleanup");
        if let Err(cleanup_err) = ctx.tms.remove_tag(ticket_id, &ctx.tags.processing).await {
            error!(ticket_id, error = %cleanup_err, "PROCESSING tag cleanup also failed; ticket may be left without a terminal tag");
        }
        return Err(err);
    }

    Ok(Outcome::Archived)
}

async fn sign_if_configured(
    ctx: &OrchestratorContext,
    rendered: Vec<u8>,
) -> Result<(Vec<u8>, SigningState), ArchiverError> {
    match &ctx.signer {
        Some(signer) => {
            let signed = signer.sign(&rendered, ctx.tsa_http_client.as_ref()).await.map_err(|e| {
                ctx.metrics.record_signing_failure();
                e
            })?;
            let cert_fingerprint = Some(signer.cert_fingerprint()?);
            Ok((
                signed,
                SigningState {
                    enabled: true,
                    tsa_used: ctx.tsa_http_client.is_some(),
                    cert_fingerprint,
                },
            ))
        }
        None => Ok((rendered, SigningState::default())),
    }
}

fn resolve_archive_path(
    ctx: &OrchestratorContext,
    snapshot: &archiver_types::Snapshot,
) -> Result<PathBuf, ArchiverError> {
    let raw_path = snapshot
        .custom_field_str(&ctx.tms_field_names.archive_path)
        .unwrap_or("");
    let raw_segments = archiver_path_policy::split_archive_path_field(raw_path);
    let path_segments = archiver_path_policy::validate_and_sanitise_segments(&raw_segments)?;

    let raw_user = resolve_archive_user(ctx, snapshot)?;
    archiver_path_policy::validate_segment(&raw_user)?;
    let user_segment = archiver_path_policy::sanitise_segment(&raw_user);

    let mut full_segments = Vec::with_capacity(path_segments.len() + 1);
    full_segments.push(user_segment.clone());
    full_segments.extend(path_segments.iter().cloned());
    archiver_path_policy::check_prefix_allow_list(&full_segments, ctx.archive.prefix_allow_list.as_deref())?;

    let filename = archiver_path_policy::render_filename(&ctx.archive.filename_pattern, &snapshot.number, chrono::Utc::now())?;

    let archive_path = archiver_path_policy::ArchivePath {
        user_segment,
        path_segments,
        filename,
    };
    let rel_path = archive_path.relative_path();
    let resolved_root = ctx
        .storage_root
        .canonicalize()
        .unwrap_or_else(|_| ctx.storage_root.clone());
    archiver_path_policy::assert_root_containment(&resolved_root, &rel_path)?;
    Ok(rel_path)
}

fn resolve_archive_user(
    ctx: &OrchestratorContext,
    snapshot: &archiver_types::Snapshot,
) -> Result<String, ArchiverError> {
    use archiver_types::ArchiveUserMode;
    match ctx.archive.archive_user_mode {
        ArchiveUserMode::Owner => Ok(snapshot.owner.clone()),
        ArchiveUserMode::CurrentAgent => snapshot
            .custom_field_str(&ctx.tms_field_names.archive_user)
            .map(str::to_string)
            .ok_or_else(|| {
                ArchiverError::permanent(
                    ErrorCode::PathPolicy,
                    format!(
                        "archive_user_mode is current_agent but field {:?} is absent on the ticket",
                        ctx.tms_field_names.archive_user
                    ),
                )
            }),
        ArchiveUserMode::Fixed => ctx.archive.fixed_archive_user.clone().ok_or_else(|| {
            ArchiverError::permanent(
                ErrorCode::PathPolicy,
                "archive_user_mode is fixed but no fixed_archive_user is configured".to_string(),
            )
        }),
    }
}

async fn apply_transition(ctx: &OrchestratorContext, ticket_id: i64, transition: &tags::TagTransition) -> Result<(), ArchiverError> {
    for tag in &transition.remove {
        ctx.tms.remove_tag(ticket_id, tag).await?;
    }
    for tag in &transition.add {
        ctx.tms.add_tag(ticket_id, tag).await?;
    }
    Ok(())
}

async fn handle_failure(
    ctx: &OrchestratorContext,
    ticket_id: i64,
    delivery_id: &Option<String>,
    request_id: &str,
    failure: &ArchiverError,
) {
    if failure.code == ErrorCode::SigningFailed || failure.code == ErrorCode::SigningMaterial {
        ctx.metrics.record_signing_failure();
    }
    if matches!(failure.code, ErrorCode::TsaTimeout | ErrorCode::TsaBadResponse | ErrorCode::TsaMisconfigured) {
        ctx.metrics.record_tsa_failure();
    }

    let note = render_error_note(failure, delivery_id, request_id);
    if let Err(e) = ctx.tms.create_internal_note(ticket_id, &note).await {
        warn!(ticket_id, error = %e, "failed to post error note after a pipeline failure");
    }

    let transition = tags::apply_error(&ctx.tags, failure.keep_trigger());
    if let Err(e) = apply_transition(ctx, ticket_id, &transition).await {
        error!(ticket_id, error = %e, "failed to apply ERROR tag transition after a pipeline failure");
    }
}

fn render_success_note(audit: &archiver_types::AuditRecord, pdf_path: &PathBuf, delivery_id: &Option<String>, request_id: &str) -> String {
    let sidecar_path = format!("{}.json", pdf_path.display());
    format!(
        "Ticket archived.\nStorage path: {}\nFilename: {}\nSidecar: {}\nSHA-256: {}\nRequest id: {}\nDelivery id: {}\nTimestamp (UTC): {}",
        escape_html(&audit.storage_path),
        escape_html(pdf_path.file_name().and_then(|n| n.to_str()).unwrap_or("")),
        escape_html(&sidecar_path),
        escape_html(&audit.sha256),
        escape_html(request_id),
        escape_html(delivery_id.as_deref().unwrap_or("")),
        now_utc().to_rfc3339(),
    )
}

fn render_error_note(failure: &ArchiverError, delivery_id: &Option<String>, request_id: &str) -> String {
    let scrubbed_message = crate::logging::scrub(&failure.message);
    format!(
        "Ticket archival failed.\nCode: {:?}\nMessage: {}\nHint: {}\nClassification: {:?}\nRequest id: {}\nDelivery id: {}\nTimestamp (UTC): {}",
        failure.code,
        escape_html(&scrubbed_message),
        escape_html(failure.code.hint()),
        failure.classification,
        escape_html(request_id),
        escape_html(delivery_id.as_deref().unwrap_or("")),
        now_utc().to_rfc3339(),
    )
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn record_phase(
    ctx: &OrchestratorContext,
    ticket_id: i64,
    delivery_id: &Option<String>,
    request_id: &str,
    phase: Phase,
    in_flight: bool,
) {
    ctx.jobs.upsert(JobRecord {
        ticket_id,
        delivery_id: delivery_id.clone(),
        request_id: request_id.to_string(),
        started_at: now_utc(),
        phase,
        in_flight,
    });
}
