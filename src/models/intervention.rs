//! Stuck-agent flags, severities, and graded interventions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity attached to warnings and stuck flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Low,
    /// Needs attention soon.
    Medium,
    /// Needs attention now.
    High,
    /// Work is being lost.
    Critical,
}

/// Graded response to a stuck agent, ordered weakest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Intervention {
    /// Record only.
    Alert,
    /// Propose a role or strategy change.
    Suggest,
    /// Propose requesting external input on the item.
    Clarify,
    /// Force the holder paused until manually resumed.
    Pause,
    /// Pause, alert, and notify the backlog.
    Escalate,
}

impl Intervention {
    /// Whether applying this intervention pauses the holder.
    #[must_use]
    pub fn pauses(self) -> bool {
        matches!(self, Self::Pause | Self::Escalate)
    }

    /// Whether applying this intervention notifies outside the daemon.
    #[must_use]
    pub fn notifies(self) -> bool {
        matches!(self, Self::Escalate)
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Suggest => "suggest",
            Self::Clarify => "clarify",
            Self::Pause => "pause",
            Self::Escalate => "escalate",
        }
    }
}

/// Classification raised by the stuck detector, in precedence order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StuckFlag {
    /// Working, but no heartbeat past the idle threshold.
    NoProgress,
    /// Claim held past the working threshold without completion.
    ExtendedWork,
    /// The same error signature keeps recurring.
    Looping,
    /// Burst of error milestones.
    ErrorSpike,
}

impl StuckFlag {
    /// Default severity of the flag.
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::ExtendedWork => Severity::Low,
            Self::NoProgress => Severity::Medium,
            Self::Looping => Severity::High,
            Self::ErrorSpike => Severity::Critical,
        }
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoProgress => "no_progress",
            Self::ExtendedWork => "extended_work",
            Self::Looping => "looping",
            Self::ErrorSpike => "error_spike",
        }
    }
}

/// An intervention that has fired and whose condition has not yet cleared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FiredIntervention {
    /// Agent the intervention targets.
    pub holder: String,
    /// Work item at the time of firing.
    pub item_id: Option<String>,
    /// Triggering condition.
    pub flag: StuckFlag,
    /// Applied intervention.
    pub intervention: Intervention,
    /// When it fired.
    pub fired_at: DateTime<Utc>,
}
