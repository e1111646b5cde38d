#![forbid(unsafe_code)]

//! Coordinating daemon for a pool of AI coding agents.
//!
//! Agents run in tmux sessions owned by the [`orchestrator::session_registry`],
//! take exclusive leased claims on work items through the [`claims`]
//! coordinator, report progress over [`ipc`], and are watched by the
//! stuck detector and orphan recovery passes.

pub mod audit;
pub mod backend;
pub mod backlog;
pub mod claims;
pub mod config;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod pool;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
