//! Session backend abstraction.
//!
//! The [`SessionBackend`] trait decouples the registry from the terminal
//! multiplexer that actually hosts sessions. The production implementation
//! is [`tmux::TmuxBackend`]; tests substitute in-memory fakes.

pub mod tmux;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::models::session::SessionKind;
use crate::Result;

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Everything the backend needs to start one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Backend session name.
    pub name: String,
    /// Directory the session starts in.
    pub working_dir: PathBuf,
    /// What to run.
    pub kind: SessionKind,
    /// File that receives the session's output.
    pub log_path: PathBuf,
    /// Logical id exported to the session as `AGENT_POOL_SESSION_ID`.
    pub session_id: String,
}

/// A session as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSession {
    /// Backend session name.
    pub name: String,
    /// Backend handle; unique per incarnation.
    pub handle: String,
}

/// Create, list, destroy, and drive persistent pseudo-terminal sessions.
pub trait SessionBackend: Send + Sync {
    /// Start a session and begin capturing its output to `spec.log_path`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::BackendUnavailable`](crate::AppError::BackendUnavailable)
    /// if the backend cannot be reached, and
    /// [`AppError::DuplicateSession`](crate::AppError::DuplicateSession) if
    /// the name is taken.
    fn create<'a>(&'a self, spec: &'a LaunchSpec) -> BackendFuture<'a, BackendSession>;

    /// Kill the session identified by `handle`, which may also be the
    /// session's exact name. Killing a session that no longer exists
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::BackendUnavailable`](crate::AppError::BackendUnavailable)
    /// if the backend cannot be reached.
    fn destroy<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()>;

    /// All sessions the backend currently hosts.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::BackendUnavailable`](crate::AppError::BackendUnavailable)
    /// if the backend cannot be reached.
    fn list(&self) -> BackendFuture<'_, Vec<BackendSession>>;

    /// Type `text` into the session, followed by Enter when `submit` is set.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::SessionNotFound`](crate::AppError::SessionNotFound)
    /// if the handle is gone.
    fn send_input<'a>(&'a self, handle: &'a str, text: &'a str, submit: bool)
        -> BackendFuture<'a, ()>;

    /// The last `max_lines` lines of the session's output.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::SessionNotFound`](crate::AppError::SessionNotFound)
    /// if the handle is gone.
    fn read_output<'a>(&'a self, handle: &'a str, max_lines: usize)
        -> BackendFuture<'a, Vec<String>>;
}
