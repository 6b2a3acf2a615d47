//! Identity registry, cloud-backed verification, and the background
//! reconciliation job that keeps the two in sync.

pub mod background_refresh;
pub mod registry;
pub mod verify;
