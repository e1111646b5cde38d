//! Session model and lifecycle helpers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RoleConfig;

/// Lifecycle status for a managed terminal session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Registered, backend session not yet confirmed.
    Creating,
    /// Backend session running.
    Active,
    /// Backend create failed or the backend lost the session.
    Errored,
    /// Torn down; never kept in the registry table.
    Destroyed,
}

/// What runs inside a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SessionKind {
    /// The backend's default interactive shell.
    Interactive,
    /// A role script launched with fixed arguments and environment.
    Scripted {
        /// Program to run.
        command: String,
        /// Program arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

impl SessionKind {
    /// Resolve the session kind for a role entry. Roles without a command,
    /// and role names missing from the table, open an interactive shell.
    #[must_use]
    pub fn for_role(role: Option<&RoleConfig>) -> Self {
        match role {
            Some(RoleConfig {
                command: Some(command),
                args,
                env,
                ..
            }) => Self::Scripted {
                command: command.clone(),
                args: args.clone(),
                env: env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            },
            _ => Self::Interactive,
        }
    }
}

/// How `create` treats a live session that already uses the derived
/// backend name. Callers must choose explicitly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExistingSession {
    /// Fail with `DuplicateSession`.
    Reject,
    /// Adopt the running session as-is.
    Reuse,
    /// Kill the running session and start a fresh one.
    Replace,
}

/// A managed pseudo-terminal session owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Logical identifier (`terminal-N`), stable across restarts.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Role identifier.
    pub role: String,
    /// Launch configuration, reused by restart.
    pub kind: SessionKind,
    /// Name of the session inside the backend.
    pub backend_name: String,
    /// Backend handle of the current incarnation; changes on restart.
    pub backend_handle: Option<String>,
    /// Directory the session is rooted at.
    pub working_dir: PathBuf,
    /// Append-only output log.
    pub log_path: PathBuf,
    /// Creation timestamp of the logical session.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Work item the session is believed to be working on.
    #[serde(default)]
    pub work_item: Option<String>,
}

impl Session {
    /// Whether `holder` names this session by logical id or display name.
    #[must_use]
    pub fn is_held_by(&self, holder: &str) -> bool {
        self.id == holder || self.name == holder
    }

    /// Whether the session still occupies its backend name.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self.status, SessionStatus::Creating | SessionStatus::Active)
    }
}

/// Derive the backend session name from a display name.
///
/// tmux rejects `.` and `:` in target names, so everything outside
/// `[a-z0-9_-]` collapses to a single `-`.
#[must_use]
pub fn derive_backend_name(prefix: &str, name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            slug.push(ch);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if prefix.is_empty() {
        slug.to_owned()
    } else {
        format!("{prefix}-{slug}")
    }
}
