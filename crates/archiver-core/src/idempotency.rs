//! Delivery dedup and per-ticket in-flight locking (C4).
//!
//! Both concerns are process-local and mutex/`DashMap`-backed by default;
//! the trait boundaries exist so a durable, multi-instance backend could
//! be substituted without touching the orchestrator (§9, "implicit global
//! state -> explicit context": both registries are injected, never reached
//! via a module-scope singleton).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

/// Outcome of claiming a delivery id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First time this delivery id has been seen within its TTL.
    Fresh,
    /// This delivery id was already claimed and has not yet expired.
    Duplicate,
}

/// `claim(delivery_id, now, ttl) -> {Fresh, Duplicate}` (§4.4). Entries
/// carry an absolute expiry and are evicted lazily, on access, once
/// expired — there is no background sweep.
pub trait DeliveryRegistry: Send + Sync {
    fn claim(&self, delivery_id: &str, now: Instant, ttl: Duration) -> ClaimOutcome;
}

/// Bounded, in-memory, mutex-free (via `DashMap`'s internal sharding)
/// delivery registry. `max_entries` bounds total memory use; when full,
/// the oldest-expiring entry is evicted to make room for a fresh claim
/// (this only matters under sustained load far exceeding `delivery_ttl`).
pub struct InMemoryDeliveryRegistry {
    entries: DashMap<String, Instant>,
    max_entries: usize,
}

impl InMemoryDeliveryRegistry {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    fn evict_one_expired_or_oldest(&self, now: Instant) {
        if let Some(expired_key) = self
            .entries
            .iter()
            .find(|e| *e.value() <= now)
            .map(|e| e.key().clone())
        {
            self.entries.remove(&expired_key);
            return;
        }
        if let Some(oldest_key) = self
            .entries
            .iter()
            .min_by_key(|e| *e.value())
            .map(|e| e.key().clone())
        {
            self.entries.remove(&oldest_key);
        }
    }
}

impl DeliveryRegistry for InMemoryDeliveryRegistry {
    fn claim(&self, delivery_id: &str, now: Instant, ttl: Duration) -> ClaimOutcome {
        // DashMap's entry API gives us atomicity per shard: only one caller
        // observes a vacant entry for a given key at a time.
        match self.entries.entry(delivery_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if *occupied.get() <= now {
                    occupied.insert(now + ttl);
                    ClaimOutcome::Fresh
                } else {
                    ClaimOutcome::Duplicate
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if self.entries.len() >= self.max_entries {
                    self.evict_one_expired_or_oldest(now);
                }
                vacant.insert(now + ttl);
                ClaimOutcome::Fresh
            }
        }
    }
}

/// Outcome of attempting to acquire the in-flight lock for a ticket.
pub enum AcquireOutcome {
    /// Lock acquired; the guard releases it on drop (or explicit
    /// [`InFlightGuard::release`]) so every exit path — including
    /// cancellation — is covered.
    Acquired(InFlightGuard),
    /// Another job already holds the lock for this ticket.
    Busy,
}

/// `try_acquire(ticket_id) -> {Acquired(release_handle), Busy}` (§4.4).
/// Always process-local; cross-instance exclusivity is explicitly not
/// provided (§4.4, §5).
pub struct InFlightSet {
    tickets: Arc<DashMap<i64, ()>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self {
            tickets: Arc::new(DashMap::new()),
        }
    }

    pub fn try_acquire(&self, ticket_id: i64) -> AcquireOutcome {
        match self.tickets.entry(ticket_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => AcquireOutcome::Busy,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(());
                AcquireOutcome::Acquired(InFlightGuard {
                    ticket_id,
                    tickets: Arc::clone(&self.tickets),
                    released: AsyncMutex::new(false),
                })
            }
        }
    }

    pub fn is_in_flight(&self, ticket_id: i64) -> bool {
        self.tickets.contains_key(&ticket_id)
    }
}

impl Default for InFlightSet {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for one ticket's in-flight lock. `release` is idempotent:
/// calling it twice, or dropping after an explicit call, is a no-op the
/// second time. This makes "release on every exit path including
/// cancellation" (§4.4) trivial for callers — a `Drop` impl is the
/// fallback if an early return forgets the explicit call.
pub struct InFlightGuard {
    ticket_id: i64,
    tickets: Arc<DashMap<i64, ()>>,
    released: AsyncMutex<bool>,
}

impl InFlightGuard {
    pub async fn release(&self) {
        let mut released = self.released.lock().await;
        if *released {
            return;
        }
        self.tickets.remove(&self.ticket_id);
        *released = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // Best-effort synchronous release for the case where a caller drops
        // the guard without awaiting `release()` (e.g. an early return
        // during a panic unwind). `try_lock` avoids blocking a Drop impl.
        if let Ok(mut released) = self.released.try_lock() {
            if !*released {
                self.tickets.remove(&self.ticket_id);
                *released = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_fresh_then_duplicate_within_ttl() {
        let registry = InMemoryDeliveryRegistry::new(1024);
        let now = Instant::now();
        let ttl = Duration::from_secs(60);
        assert_eq!(registry.claim("d1", now, ttl), ClaimOutcome::Fresh);
        assert_eq!(registry.claim("d1", now, ttl), ClaimOutcome::Duplicate);
    }

    #[test]
    fn claim_is_fresh_again_after_ttl_expires() {
        let registry = InMemoryDeliveryRegistry::new(1024);
        let now = Instant::now();
        let ttl = Duration::from_secs(60);
        assert_eq!(registry.claim("d1", now, ttl), ClaimOutcome::Fresh);
        let later = now + ttl + Duration::from_secs(1);
        assert_eq!(registry.claim("d1", later, ttl), ClaimOutcome::Fresh);
    }

    #[test]
    fn distinct_delivery_ids_do_not_collide() {
        let registry = InMemoryDeliveryRegistry::new(1024);
        let now = Instant::now();
        let ttl = Duration::from_secs(60);
        assert_eq!(registry.claim("a", now, ttl), ClaimOutcome::Fresh);
        assert_eq!(registry.claim("b", now, ttl), ClaimOutcome::Fresh);
    }

    #[test]
    fn registry_evicts_to_respect_max_entries() {
        let registry = InMemoryDeliveryRegistry::new(2);
        let now = Instant::now();
        let ttl = Duration::from_secs(60);
        registry.claim("a", now, ttl);
        registry.claim("b", now, ttl);
        registry.claim("c", now, ttl);
        assert!(registry.entries.len() <= 2);
    }

    #[tokio::test]
    async fn second_acquire_is_busy_until_release() {
        let set = InFlightSet::new();
        let guard = match set.try_acquire(42) {
            AcquireOutcome::Acquired(g) => g,
            AcquireOutcome::Busy => panic!("expected Acquired"),
        };
        assert!(matches!(set.try_acquire(42), AcquireOutcome::Busy));
        guard.release().await;
        assert!(matches!(set.try_acquire(42), AcquireOutcome::Acquired(_)));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let set = InFlightSet::new();
        let guard = match set.try_acquire(7) {
            AcquireOutcome::Acquired(g) => g,
            AcquireOutcome::Busy => panic!("expected Acquired"),
        };
        guard.release().await;
        guard.release().await;
        assert!(!set.is_in_flight(7));
    }

    #[test]
    fn drop_without_explicit_release_still_frees_the_ticket() {
        let set = InFlightSet::new();
        {
            let _guard = match set.try_acquire(99) {
                AcquireOutcome::Acquired(g) => g,
                AcquireOutcome::Busy => panic!("expected Acquired"),
            };
            assert!(set.is_in_flight(99));
        }
        assert!(!set.is_in_flight(99));
    }
}
