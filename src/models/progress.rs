//! Agent progress records: heartbeats, status, and the milestone log.

use std::borrow::Cow;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Reported agent status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Actively working the item.
    Working,
    /// Alive, waiting for work.
    Idle,
    /// Terminal for this record; set by orphan recovery.
    Errored,
    /// Held by an intervention until manually resumed.
    Paused,
}

/// Milestone classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneKind {
    /// Free-form progress note.
    Note,
    /// Error encountered by the agent.
    Error,
    /// Work on the item is complete.
    Completed,
}

/// A single entry in the append-only milestone log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Milestone {
    /// When the agent reported it.
    pub at: DateTime<Utc>,
    /// Classification.
    pub kind: MilestoneKind,
    /// Agent-supplied text.
    pub message: String,
}

// Hex ids, numbers, and quoted fragments vary between otherwise identical errors.
static VOLATILE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"0x[0-9a-fA-F]+|\b[0-9a-fA-F]{8,}\b|\d+|"[^"]*"|'[^']*'"#).ok()
});

const SIGNATURE_LEN: usize = 120;

impl Milestone {
    /// Normalized error signature used for loop detection.
    ///
    /// Numbers, hex ids, and quoted fragments are masked, whitespace is
    /// collapsed, and the result is lowercased and truncated.
    #[must_use]
    pub fn signature(&self) -> String {
        let masked = match VOLATILE.as_ref() {
            Some(re) => re.replace_all(&self.message, "#"),
            None => Cow::Borrowed(self.message.as_str()),
        };
        let collapsed = masked.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.to_lowercase().chars().take(SIGNATURE_LEN).collect()
    }
}

/// Liveness and progress state for one holder on one work item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProgressRecord {
    /// Agent identity.
    pub holder: String,
    /// Work item being worked.
    pub item_id: Option<String>,
    /// When the record was started.
    pub started_at: DateTime<Utc>,
    /// Last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Current status.
    pub status: AgentStatus,
    /// Append-only milestone log.
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

impl ProgressRecord {
    /// Start a new working record at `now`.
    #[must_use]
    pub fn begin(holder: String, item_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            holder,
            item_id,
            started_at: now,
            last_heartbeat: now,
            status: AgentStatus::Working,
            milestones: Vec::new(),
        }
    }

    /// Seconds since the last heartbeat at `now`.
    #[must_use]
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.last_heartbeat)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }

    /// Whether the log contains a completion milestone.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.milestones
            .iter()
            .any(|m| m.kind == MilestoneKind::Completed)
    }

    /// Error milestones reported at or after `since`.
    pub fn errors_since(&self, since: DateTime<Utc>) -> impl Iterator<Item = &Milestone> {
        self.milestones
            .iter()
            .filter(move |m| m.kind == MilestoneKind::Error && m.at >= since)
    }
}
