//! Certificate generation and rotation: per-subscription generators and
//! the engine that drives them from the expiry, CA-change, and
//! connectivity-change triggers.

pub mod engine;
pub mod generator;
