//! Session orchestration and the periodic passes over the pool.
//!
//! Covers the session registry, the stuck-agent detector, orphan recovery,
//! and lapsed-claim sweeping.

pub mod claim_sweeper;
pub mod orphan_recovery;
pub mod session_registry;
pub mod stuck_detector;
