//! Domain model module declarations.

pub mod claim;
pub mod intervention;
pub mod progress;
pub mod session;
pub mod warning;
