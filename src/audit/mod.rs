//! Structured audit trail for pool events.
//!
//! Provides the [`AuditLogger`] trait and the [`AuditEntry`] record. The
//! daemon writes through [`JsonlAuditWriter`], which appends one JSON object
//! per line to daily files under `<state_dir>/logs/`.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event classification for audit entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Daemon finished startup.
    DaemonStart,
    /// Daemon finished a graceful shutdown.
    DaemonStop,
    /// Session created.
    SessionCreate,
    /// Session destroyed.
    SessionDestroy,
    /// Session killed and re-created.
    SessionRestart,
    /// Claim granted.
    ClaimGrant,
    /// Claim released by its holder.
    ClaimRelease,
    /// Stuck-agent intervention fired.
    Intervention,
    /// Orphaned work item recovered.
    OrphanRecovery,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Event classification.
    pub event_type: AuditEventType,
    /// Logical session id, for session events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Work item, for claim, intervention, and recovery events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// Claim holder or agent identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    /// Free-form event detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl AuditEntry {
    /// Entry of `event_type` stamped now.
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            session_id: None,
            item_id: None,
            holder: None,
            detail: None,
        }
    }

    /// Set the session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the work item.
    #[must_use]
    pub fn with_item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    /// Set the holder.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = Some(holder.into());
        self
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Sink for audit entries.
///
/// Implementations must be [`Send`] and [`Sync`] to be shared across tasks
/// via [`std::sync::Arc`].
pub trait AuditLogger: Send + Sync {
    /// Record a single audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write fails.
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()>;
}

pub use writer::JsonlAuditWriter;
