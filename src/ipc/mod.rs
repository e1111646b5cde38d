//! Local IPC layer.
//!
//! A named pipe (Windows) or Unix domain socket (Linux/macOS) server that
//! accepts line-delimited JSON requests from `agent-pool-ctl` and from agent
//! helper scripts.

pub mod protocol;
pub mod server;
