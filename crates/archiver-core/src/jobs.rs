//! Process-local job record table (C16 backing store, §3a).
//!
//! Purely introspective: nothing here drives behaviour, it only remembers
//! enough about the most recent (or in-flight) job per ticket for
//! `/jobs/{ticket_id}` to answer without touching the TMS. Bounded by a
//! simple LRU so a long-running instance cannot grow this without limit.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Serialize;

/// One named step of the orchestrator's pipeline (§4.12), used both for the
/// job record's `phase` and for structured log events (C15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ValidatingTicketId,
    Acknowledged,
    AcquiringLock,
    ClaimingDelivery,
    EvaluatingEligibility,
    TransitioningToProcessing,
    FetchingSnapshot,
    Rendering,
    Signing,
    WritingArchive,
    WritingAudit,
    PostingSuccessNote,
    TransitioningToDone,
    ReleasingLock,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub ticket_id: i64,
    pub delivery_id: Option<String>,
    pub request_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub phase: Phase,
    pub in_flight: bool,
}

/// Bounded `ticket_id -> JobRecord` table with least-recently-updated
/// eviction. Guarded by a plain `Mutex`: updates happen once per
/// orchestrator step, not in a hot loop, so contention is not a concern.
pub struct JobTable {
    inner: Mutex<JobTableInner>,
    max_entries: usize,
}

struct JobTableInner {
    records: HashMap<i64, JobRecord>,
    order: VecDeque<i64>,
}

impl JobTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(JobTableInner {
                records: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries,
        }
    }

    /// Inserts or overwrites the record for `ticket_id`, bumping it to
    /// most-recently-updated.
    pub fn upsert(&self, record: JobRecord) {
        let mut inner = self.inner.lock().expect("job table mutex poisoned");
        let ticket_id = record.ticket_id;
        if !inner.records.contains_key(&ticket_id) && inner.records.len() >= self.max_entries {
            if let Some(evicted) = inner.order.pop_front() {
                inner.records.remove(&evicted);
            }
        }
        inner.order.retain(|id| *id != ticket_id);
        inner.order.push_back(ticket_id);
        inner.records.insert(ticket_id, record);
    }

    pub fn get(&self, ticket_id: i64) -> Option<JobRecord> {
        let inner = self.inner.lock().expect("job table mutex poisoned");
        inner.records.get(&ticket_id).cloned()
    }
}

pub fn now_utc() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::<chrono::Utc>::from(SystemTime::now())
}
