//! Error types shared across the daemon, the ctl companion, and the library.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// IPC transport failure (socket creation, connect, framing).
    Ipc(String),
    /// The session backend could not be reached or timed out. Retryable.
    BackendUnavailable(String),
    /// A live session with the same derived backend name already exists.
    DuplicateSession(String),
    /// No session is registered under the given logical id.
    SessionNotFound(String),
    /// The work item is held by another, non-expired claim.
    AlreadyClaimed {
        /// Contested work-item identifier.
        item_id: String,
        /// Identity of the current holder.
        holder: String,
        /// When the current claim lapses.
        expires_at: DateTime<Utc>,
    },
    /// Caller tried to release a claim recorded under a different holder.
    NotHolder {
        /// Work-item identifier.
        item_id: String,
        /// Identity of the recorded holder.
        holder: String,
    },
    /// Malformed or unknown request on the IPC wire.
    Protocol(String),
    /// Persisted state contradicted by live evidence.
    StaleState(String),
    /// External backlog request failure. Retryable.
    Backlog(String),
    /// The daemon is draining and refuses new sessions or claims.
    ShuttingDown,
}

impl AppError {
    /// Stable snake-case code for this error, used on the IPC wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Ipc(_) => "ipc",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::DuplicateSession(_) => "duplicate_session",
            Self::SessionNotFound(_) => "session_not_found",
            Self::AlreadyClaimed { .. } => "already_claimed",
            Self::NotHolder { .. } => "not_holder",
            Self::Protocol(_) => "protocol_error",
            Self::StaleState(_) => "stale_state",
            Self::Backlog(_) => "backlog",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Whether the caller may retry the failed operation after a backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Backlog(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::BackendUnavailable(msg) => write!(f, "backend unavailable: {msg}"),
            Self::DuplicateSession(msg) => write!(f, "duplicate session: {msg}"),
            Self::SessionNotFound(msg) => write!(f, "session not found: {msg}"),
            Self::AlreadyClaimed {
                item_id,
                holder,
                expires_at,
            } => write!(
                f,
                "already claimed: {item_id} is held by {holder} until {}",
                expires_at.to_rfc3339()
            ),
            Self::NotHolder { item_id, holder } => {
                write!(f, "not holder: {item_id} is held by {holder}")
            }
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::StaleState(msg) => write!(f, "stale state: {msg}"),
            Self::Backlog(msg) => write!(f, "backlog: {msg}"),
            Self::ShuttingDown => write!(f, "shutting down: daemon is not accepting new work"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(format!("json: {err}"))
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}
