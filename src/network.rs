//! Network state provider.
//!
//! Abstracts over MQTT connectivity up/down and broadcasts transitions to
//! the components that gate work on it (`ConnectivityShadowMachine`,
//! `BackgroundRefresh`, the cloud-call worker pool).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::events::{DomainEventBus, NetworkTransition};

/// Tracks whether the MQTT transport is currently connected and notifies
/// the event bus on each transition (duplicate reports of the same state
/// are suppressed).
pub struct NetworkStateProvider {
    up: AtomicBool,
    bus: Arc<DomainEventBus>,
}

impl NetworkStateProvider {
    /// Construct a provider starting in the down state.
    pub fn new(bus: Arc<DomainEventBus>) -> Self {
        Self { up: AtomicBool::new(false), bus }
    }

    /// Whether the network is currently considered up.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Report that the network came up. A no-op if already up.
    pub fn notify_up(&self) {
        if !self.up.swap(true, Ordering::SeqCst) {
            self.bus.emit(NetworkTransition::Up);
        }
    }

    /// Report that the network went down. A no-op if already down.
    pub fn notify_down(&self) {
        if self.up.swap(false, Ordering::SeqCst) {
            self.bus.emit(NetworkTransition::Down);
        }
    }
}
