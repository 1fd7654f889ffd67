//! Per-triple mutual exclusion (spec §5).
//!
//! At most one sync job per `(user_id, connection_id, external_calendar_id)`
//! may run at a time. Grounded on the spec's own design note (§9): "a keyed
//! mutex map with cleanup when idle" — implemented with `moka`, which the
//! teacher already depends on for TTL-bounded caches elsewhere, repurposed
//! here to auto-expire a lease if a job panics without releasing it.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use uuid::Uuid;

/// Identifies the unit of sync concurrency: `(user, connection, calendar)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncTriple {
    pub user_id: Uuid,
    pub connection_id: Uuid,
    pub external_calendar_id: String,
}

/// Registry of in-flight sync triples. Push does not consult this registry
/// (spec §9 Open Question (a): not required).
pub struct LeaseRegistry {
    running: Cache<SyncTriple, ()>,
}

/// RAII guard: releases the triple's lease when dropped, so a panicking
/// job still frees it up rather than leaving it stuck forever. Owns its
/// own `Arc<LeaseRegistry>` clone (rather than borrowing `&LeaseRegistry`)
/// so the guard is `'static` and can be moved into a spawned task.
pub struct LeaseGuard {
    registry: Arc<LeaseRegistry>,
    triple: SyncTriple,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.registry.running.invalidate(&self.triple);
    }
}

impl LeaseRegistry {
    /// `stale_after` bounds how long a lease can be held if its guard is
    /// somehow never dropped (e.g. a detached task that was killed).
    pub fn new(stale_after: Duration) -> Self {
        Self {
            running: Cache::builder().time_to_live(stale_after).build(),
        }
    }

    /// Attempt to acquire the lease for `triple`. Returns `None` if a job
    /// for that triple is already running (the caller should report
    /// `already_running` rather than proceed).
    ///
    /// Takes `self` as an `Arc` so the returned guard owns a clone and can
    /// outlive the borrow that produced it (e.g. cross a `tokio::spawn`
    /// boundary). Uses `Cache::entry().or_insert_with()` rather than a
    /// separate `get` then `insert`, so two concurrent callers racing on the
    /// same triple cannot both observe it absent and both acquire it.
    pub fn try_acquire(self: &Arc<Self>, triple: SyncTriple) -> Option<LeaseGuard> {
        let entry = self.running.entry(triple.clone()).or_insert_with(|| ());
        if !entry.is_fresh() {
            return None;
        }
        Some(LeaseGuard {
            registry: Arc::clone(self),
            triple,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(n: &str) -> SyncTriple {
        SyncTriple {
            user_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            external_calendar_id: n.to_string(),
        }
    }

    #[test]
    fn test_second_acquire_for_same_triple_is_rejected() {
        let registry = Arc::new(LeaseRegistry::new(Duration::from_secs(60)));
        let t = triple("cal-1");

        let guard1 = registry.try_acquire(t.clone());
        assert!(guard1.is_some());

        let guard2 = registry.try_acquire(t.clone());
        assert!(guard2.is_none());
    }

    #[test]
    fn test_independent_triples_proceed_in_parallel() {
        let registry = Arc::new(LeaseRegistry::new(Duration::from_secs(60)));
        let g1 = registry.try_acquire(triple("cal-1"));
        let g2 = registry.try_acquire(triple("cal-2"));
        assert!(g1.is_some());
        assert!(g2.is_some());
    }

    #[test]
    fn test_lease_released_on_drop() {
        let registry = Arc::new(LeaseRegistry::new(Duration::from_secs(60)));
        let t = triple("cal-1");

        {
            let _guard = registry.try_acquire(t.clone());
        }

        let guard2 = registry.try_acquire(t);
        assert!(guard2.is_some());
    }

    #[test]
    fn test_concurrent_acquire_only_one_wins() {
        use std::thread;

        let registry = Arc::new(LeaseRegistry::new(Duration::from_secs(60)));
        let t = triple("cal-race");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let t = t.clone();
                thread::spawn(move || registry.try_acquire(t).is_some())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
    }
}
