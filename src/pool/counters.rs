//! Monotonic pool counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Persisted counter values.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Counters {
    /// Times the daemon has started against this state directory.
    pub daemon_starts: u64,
    /// Sessions created.
    pub sessions_created: u64,
    /// Sessions destroyed.
    pub sessions_destroyed: u64,
    /// Next logical session number to hand out.
    pub next_session_seq: u64,
    /// Claims granted.
    pub claims_granted: u64,
    /// Claims released by their holder.
    pub claims_released: u64,
    /// Claim attempts rejected because the item was held.
    pub claims_conflicted: u64,
    /// Lapsed claims reaped.
    pub claims_expired: u64,
    /// Interventions fired by the stuck detector.
    pub interventions_fired: u64,
    /// Orphans recovered with commit.
    pub orphans_recovered: u64,
    /// Warnings raised.
    pub warnings_raised: u64,
}

/// Individual counter selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Counter {
    DaemonStarts,
    SessionsCreated,
    SessionsDestroyed,
    ClaimsGranted,
    ClaimsReleased,
    ClaimsConflicted,
    ClaimsExpired,
    InterventionsFired,
    OrphansRecovered,
    WarningsRaised,
}

/// Live counters shared by every component. Values only ever grow.
#[derive(Debug, Default)]
pub struct PoolCounters {
    daemon_starts: AtomicU64,
    sessions_created: AtomicU64,
    sessions_destroyed: AtomicU64,
    next_session_seq: AtomicU64,
    claims_granted: AtomicU64,
    claims_released: AtomicU64,
    claims_conflicted: AtomicU64,
    claims_expired: AtomicU64,
    interventions_fired: AtomicU64,
    orphans_recovered: AtomicU64,
    warnings_raised: AtomicU64,
}

impl PoolCounters {
    /// Counters seeded from a persisted snapshot.
    #[must_use]
    pub fn restored(saved: &Counters) -> Self {
        let counters = Self::default();
        counters.absorb(saved);
        counters
    }

    /// Raise every counter to at least the persisted value.
    pub fn absorb(&self, saved: &Counters) {
        let pairs = [
            (&self.daemon_starts, saved.daemon_starts),
            (&self.sessions_created, saved.sessions_created),
            (&self.sessions_destroyed, saved.sessions_destroyed),
            (&self.next_session_seq, saved.next_session_seq),
            (&self.claims_granted, saved.claims_granted),
            (&self.claims_released, saved.claims_released),
            (&self.claims_conflicted, saved.claims_conflicted),
            (&self.claims_expired, saved.claims_expired),
            (&self.interventions_fired, saved.interventions_fired),
            (&self.orphans_recovered, saved.orphans_recovered),
            (&self.warnings_raised, saved.warnings_raised),
        ];
        for (cell, value) in pairs {
            cell.fetch_max(value, Ordering::Relaxed);
        }
    }

    fn cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::DaemonStarts => &self.daemon_starts,
            Counter::SessionsCreated => &self.sessions_created,
            Counter::SessionsDestroyed => &self.sessions_destroyed,
            Counter::ClaimsGranted => &self.claims_granted,
            Counter::ClaimsReleased => &self.claims_released,
            Counter::ClaimsConflicted => &self.claims_conflicted,
            Counter::ClaimsExpired => &self.claims_expired,
            Counter::InterventionsFired => &self.interventions_fired,
            Counter::OrphansRecovered => &self.orphans_recovered,
            Counter::WarningsRaised => &self.warnings_raised,
        }
    }

    /// Increment `counter` by one.
    pub fn bump(&self, counter: Counter) {
        self.add(counter, 1);
    }

    /// Increment `counter` by `n`.
    pub fn add(&self, counter: Counter, n: u64) {
        self.cell(counter).fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of `counter`.
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.cell(counter).load(Ordering::Relaxed)
    }

    /// Hand out the next logical session number, starting at 1.
    pub fn next_session_seq(&self) -> u64 {
        self.next_session_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Make sure future session numbers are greater than `seen`.
    pub fn observe_session_seq(&self, seen: u64) {
        self.next_session_seq.fetch_max(seen, Ordering::Relaxed);
    }

    /// Point-in-time copy for persistence and status.
    #[must_use]
    pub fn snapshot(&self) -> Counters {
        let load = |cell: &AtomicU64| cell.load(Ordering::Relaxed);
        Counters {
            daemon_starts: load(&self.daemon_starts),
            sessions_created: load(&self.sessions_created),
            sessions_destroyed: load(&self.sessions_destroyed),
            next_session_seq: load(&self.next_session_seq),
            claims_granted: load(&self.claims_granted),
            claims_released: load(&self.claims_released),
            claims_conflicted: load(&self.claims_conflicted),
            claims_expired: load(&self.claims_expired),
            interventions_fired: load(&self.interventions_fired),
            orphans_recovered: load(&self.orphans_recovered),
            warnings_raised: load(&self.warnings_raised),
        }
    }
}
