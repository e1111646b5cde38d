//! Wire types for the IPC protocol.
//!
//! Request (one JSON object per line, tagged by `command`):
//! ```json
//! {"command": "claim", "item_id": "issue-42", "holder": "terminal-1"}
//! {"command": "create_session", "name": "worker", "working_dir": "/repo", "on_existing": "reject"}
//! {"command": "recover", "commit": true}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... }}
//! {"ok": false, "error": "already claimed: ...", "kind": "already_claimed", "holder": "terminal-2"}
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::progress::{AgentStatus, MilestoneKind};
use crate::models::session::ExistingSession;
use crate::AppError;

/// Lines returned by `read_output` when the caller does not say.
pub const DEFAULT_OUTPUT_LINES: usize = 50;

fn default_role() -> String {
    "agent".into()
}

fn default_submit() -> bool {
    true
}

fn default_output_lines() -> usize {
    DEFAULT_OUTPUT_LINES
}

/// Inbound request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Daemon status summary.
    Status,
    /// Registered sessions.
    ListSessions,
    /// Create a session.
    CreateSession {
        /// Display name.
        name: String,
        /// Role id; unknown roles get an interactive shell.
        #[serde(default = "default_role")]
        role: String,
        /// Directory the session starts in.
        working_dir: PathBuf,
        /// Policy for a live session with the same name. Required.
        on_existing: ExistingSession,
    },
    /// Destroy a session.
    DestroySession {
        /// Logical session id.
        id: String,
    },
    /// Restart a session in place.
    RestartSession {
        /// Logical session id.
        id: String,
    },
    /// Type into a session.
    SendInput {
        /// Logical session id.
        id: String,
        /// Text to type.
        text: String,
        /// Press Enter afterwards.
        #[serde(default = "default_submit")]
        submit: bool,
    },
    /// Read a session's recent output.
    ReadOutput {
        /// Logical session id.
        id: String,
        /// Number of trailing lines.
        #[serde(default = "default_output_lines")]
        max_lines: usize,
    },
    /// Claim a work item.
    Claim {
        /// Work item.
        item_id: String,
        /// Claimant identity.
        holder: String,
        /// Lease length; the configured default when absent.
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },
    /// Extend a held claim.
    Renew {
        /// Work item.
        item_id: String,
        /// Current holder.
        holder: String,
        /// New lease length from now.
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },
    /// Release a held claim.
    Release {
        /// Work item.
        item_id: String,
        /// Current holder.
        holder: String,
    },
    /// Holder and expiry of an item.
    Check {
        /// Work item.
        item_id: String,
    },
    /// Live claims.
    ListClaims,
    /// Agent heartbeat.
    Heartbeat {
        /// Agent identity.
        holder: String,
        /// Item being worked on.
        #[serde(default)]
        item_id: Option<String>,
        /// Reported status.
        #[serde(default)]
        status: Option<AgentStatus>,
    },
    /// Agent milestone.
    Milestone {
        /// Agent identity.
        holder: String,
        /// Milestone kind.
        kind: MilestoneKind,
        /// Free-form text.
        message: String,
    },
    /// Return a paused agent to work.
    Resume {
        /// Agent identity.
        holder: String,
    },
    /// Orphan recovery; dry run unless `commit` is set.
    Recover {
        /// Perform writes.
        #[serde(default)]
        commit: bool,
    },
}

impl IpcRequest {
    /// Wire name of the command.
    #[must_use]
    pub fn command(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::ListSessions => "list_sessions",
            Self::CreateSession { .. } => "create_session",
            Self::DestroySession { .. } => "destroy_session",
            Self::RestartSession { .. } => "restart_session",
            Self::SendInput { .. } => "send_input",
            Self::ReadOutput { .. } => "read_output",
            Self::Claim { .. } => "claim",
            Self::Renew { .. } => "renew",
            Self::Release { .. } => "release",
            Self::Check { .. } => "check",
            Self::ListClaims => "list_claims",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Milestone { .. } => "milestone",
            Self::Resume { .. } => "resume",
            Self::Recover { .. } => "recover",
        }
    }
}

/// Outbound response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error code on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Conflicting holder, for claim errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

impl IpcResponse {
    /// Successful response carrying `data`.
    #[must_use]
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            kind: None,
            holder: None,
        }
    }

    /// Failure response describing `err`.
    #[must_use]
    pub fn failure(err: &AppError) -> Self {
        let holder = match err {
            AppError::AlreadyClaimed { holder, .. } | AppError::NotHolder { holder, .. } => {
                Some(holder.clone())
            }
            _ => None,
        };
        Self {
            ok: false,
            data: None,
            error: Some(err.to_string()),
            kind: Some(err.kind().to_owned()),
            holder,
        }
    }
}
