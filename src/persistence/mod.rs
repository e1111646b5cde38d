//! On-disk state owned by the daemon: the Pool State document and the
//! single-instance pidfile.

pub mod pidfile;
pub mod state_store;
