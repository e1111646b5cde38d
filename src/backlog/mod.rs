//! External backlog integration.
//!
//! The pool only touches the backlog through labels and comments: recovery
//! lists items carrying the in-progress label, moves them back to ready, and
//! leaves a comment explaining why.

pub mod github;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::{BacklogProvider, GlobalConfig};
use crate::Result;

/// Boxed future returned by backlog operations.
pub type BacklogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Label-and-comment view of the shared work-item backlog.
pub trait Backlog: Send + Sync {
    /// Item ids currently carrying the in-progress label.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backlog`](crate::AppError::Backlog) on request failure.
    fn in_progress(&self) -> BacklogFuture<'_, Vec<String>>;

    /// Replace label `from` with label `to` on `item_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backlog`](crate::AppError::Backlog) on request failure.
    fn transition<'a>(&'a self, item_id: &'a str, from: &'a str, to: &'a str)
        -> BacklogFuture<'a, ()>;

    /// Post a comment on `item_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Backlog`](crate::AppError::Backlog) on request failure.
    fn comment<'a>(&'a self, item_id: &'a str, body: &'a str) -> BacklogFuture<'a, ()>;
}

/// Backlog used when no provider is configured: nothing is in progress and
/// every write is accepted and dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBacklog;

impl Backlog for NoBacklog {
    fn in_progress(&self) -> BacklogFuture<'_, Vec<String>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn transition<'a>(
        &'a self,
        _item_id: &'a str,
        _from: &'a str,
        _to: &'a str,
    ) -> BacklogFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn comment<'a>(&'a self, _item_id: &'a str, _body: &'a str) -> BacklogFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Build the backlog client selected by `[backlog] provider`.
///
/// # Errors
///
/// Returns [`AppError::Config`](crate::AppError::Config) when the GitHub
/// provider lacks a repository or token.
pub fn from_config(config: &GlobalConfig) -> Result<Arc<dyn Backlog>> {
    match config.backlog.provider {
        BacklogProvider::None => Ok(Arc::new(NoBacklog)),
        BacklogProvider::Github => Ok(Arc::new(github::GithubBacklog::new(&config.backlog)?)),
    }
}
