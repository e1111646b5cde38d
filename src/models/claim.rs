//! Claim (lease) record model.
//!
//! The serialized form of [`Claim`] is also the on-disk lock record, so
//! field names are part of the wire format shared by every process that
//! touches the claims directory.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An exclusive, time-bounded ownership record over a work item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Claim {
    /// Externally defined work-item identifier.
    pub item_id: String,
    /// Identity of the owner.
    pub holder: String,
    /// Grant timestamp.
    pub created_at: DateTime<Utc>,
    /// Lease end; past this instant the claim is logically released.
    pub expires_at: DateTime<Utc>,
    /// Lease length in seconds.
    pub ttl_seconds: u64,
    /// Unique per grant; distinguishes two successive claims on one item.
    pub nonce: String,
    /// Process id of the claimant.
    #[serde(default)]
    pub pid: Option<u32>,
}

impl Claim {
    /// Build a new claim starting at `now`.
    #[must_use]
    pub fn new(item_id: String, holder: String, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl_seconds = ttl.as_secs().max(1);
        let expires_at = i64::try_from(ttl_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            item_id,
            holder,
            created_at: now,
            expires_at,
            ttl_seconds,
            nonce: Uuid::new_v4().to_string(),
            pid: Some(std::process::id()),
        }
    }

    /// Whether the lease has lapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining lease time at `now`, zero once expired.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Time the claim has been held at `now`.
    #[must_use]
    pub fn held_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}
