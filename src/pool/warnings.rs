//! Bounded warning list.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use super::counters::{Counter, PoolCounters};
use crate::models::warning::Warning;

/// Most recent warnings, oldest dropped first once `capacity` is reached.
#[derive(Debug)]
pub struct WarningLog {
    entries: Mutex<VecDeque<Warning>>,
    capacity: usize,
    counters: Arc<PoolCounters>,
}

impl WarningLog {
    /// Empty log holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize, counters: Arc<PoolCounters>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            counters,
        }
    }

    /// Record a warning.
    pub fn push(&self, warning: Warning) {
        warn!(
            kind = ?warning.kind,
            severity = ?warning.severity,
            context = ?warning.context,
            "{}",
            warning.message
        );
        self.counters.bump(Counter::WarningsRaised);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(warning);
    }

    /// Record a warning unless one with the same kind and message is
    /// already held. Returns whether it was recorded.
    pub fn push_unique(&self, warning: Warning) -> bool {
        let present = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|w| w.kind == warning.kind && w.message == warning.message);
        if present {
            return false;
        }
        self.push(warning);
        true
    }

    /// Copy of all held warnings, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Warning> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Replace the held warnings with a persisted list, keeping the newest.
    pub fn restore(&self, saved: Vec<Warning>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
        let skip = saved.len().saturating_sub(self.capacity);
        entries.extend(saved.into_iter().skip(skip));
    }

    /// Number of held warnings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no warnings are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
