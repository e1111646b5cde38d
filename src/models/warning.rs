//! Pool-level warnings raised by reconciliation and background passes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::intervention::Severity;

/// Warning classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Backend kill failed or timed out during destroy.
    BackendKillFailed,
    /// Persisted session contradicted by the backend.
    StaleSession,
    /// Claim without a live owner.
    StaleClaim,
    /// Backlog item in progress with nobody working it.
    UntrackedItem,
    /// Working agent stopped heartbeating.
    StaleHeartbeat,
    /// Stuck detector intervention.
    StuckAgent,
    /// Backlog call failed.
    Backlog,
    /// A committed recovery left an item half-reset.
    RecoveryFailed,
    /// Pool State document could not be parsed and was moved aside.
    CorruptState,
}

/// A diagnostic kept in the pool state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Warning {
    /// Classification.
    pub kind: WarningKind,
    /// Severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// Resource identifiers and other context.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// When the warning was raised.
    pub at: DateTime<Utc>,
}

impl Warning {
    /// Construct a warning stamped with the current time.
    #[must_use]
    pub fn new(kind: WarningKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            context: BTreeMap::new(),
            at: Utc::now(),
        }
    }

    /// Attach a context entry.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.context.insert(key.to_owned(), value.into());
        self
    }
}
