//! In-process domain event bus.
//!
//! Decouples configuration changes from the CA, the CA from rotation, and
//! identity updates from anything that wants to observe them. Dispatch is
//! synchronous and single-threaded per emission: each handler runs
//! in-line on the publisher's call stack, in registration order, with one
//! handler's panic or error isolated from the rest.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

/// A domain event fanned out by `DomainEventBus`.
pub trait DomainEvent: Any + Send + Sync + std::fmt::Debug {
    /// Short, stable name used in log messages.
    fn event_name(&self) -> &'static str;
}

/// The certificate authority was swapped (managed <-> custom, or
/// key/algorithm change within a kind).
#[derive(Debug, Clone)]
pub struct CaChanged {
    /// Fingerprint-ish summary of the new CA leaf's subject, for logging.
    pub new_subject: String,
    /// When the swap completed.
    pub at: DateTime<Utc>,
}

impl DomainEvent for CaChanged {
    fn event_name(&self) -> &'static str {
        "CAChanged"
    }
}

/// The cloud-reported connectivity info (host address set) changed.
#[derive(Debug, Clone)]
pub struct ConnectivityChanged {
    /// The new address set.
    pub addresses: Vec<String>,
    /// When the change was observed.
    pub at: DateTime<Utc>,
}

impl DomainEvent for ConnectivityChanged {
    fn event_name(&self) -> &'static str {
        "ConnectivityChanged"
    }
}

/// A Thing record's attachment map changed.
#[derive(Debug, Clone)]
pub struct ThingUpdated {
    /// The Thing's name.
    pub thing_name: String,
    /// When the update was applied.
    pub at: DateTime<Utc>,
}

impl DomainEvent for ThingUpdated {
    fn event_name(&self) -> &'static str {
        "ThingUpdated"
    }
}

/// The network transitioned between up and down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTransition {
    /// MQTT connectivity became available.
    Up,
    /// MQTT connectivity was lost.
    Down,
}

impl DomainEvent for NetworkTransition {
    fn event_name(&self) -> &'static str {
        match self {
            NetworkTransition::Up => "NetworkUp",
            NetworkTransition::Down => "NetworkDown",
        }
    }
}

/// Synchronous, type-keyed, in-process publish/subscribe bus. A handler
/// that panics or otherwise misbehaves is isolated from other handlers of
/// the same event (each call is wrapped so one failing subscriber cannot
/// prevent the others from observing the event); handlers needing async
/// work must schedule their own task rather than block the emitting
/// thread.
#[derive(Default)]
pub struct DomainEventBus {
    handlers: RwLock<HashMap<TypeId, Vec<Box<dyn Fn(&dyn Any) + Send + Sync>>>>,
}

impl DomainEventBus {
    /// Construct an empty bus.
    pub fn new() -> Self {
        Self { handlers: RwLock::new(HashMap::new()) }
    }

    /// Register a handler for events of type `E`.
    pub fn subscribe<E: DomainEvent + 'static>(&self, handler: impl Fn(&E) + Send + Sync + 'static) {
        let boxed: Box<dyn Fn(&dyn Any) + Send + Sync> = Box::new(move |event: &dyn Any| {
            if let Some(typed) = event.downcast_ref::<E>() {
                handler(typed);
            }
        });
        self.handlers
            .write()
            .unwrap()
            .entry(TypeId::of::<E>())
            .or_default()
            .push(boxed);
    }

    /// Fan out `event` to every handler registered for its concrete type.
    /// Each handler invocation is isolated: a panic in one handler is
    /// caught and logged rather than aborting the emission or the
    /// emitting thread.
    pub fn emit<E: DomainEvent + 'static>(&self, event: E) {
        tracing::debug!(event = event.event_name(), "emitting domain event");
        let handlers = self.handlers.read().unwrap();
        if let Some(list) = handlers.get(&TypeId::of::<E>()) {
            for handler in list {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event)));
                if let Err(panic) = result {
                    tracing::error!(
                        event = event.event_name(),
                        "domain event handler panicked: {:?}",
                        panic
                    );
                }
            }
        }
    }
}

/// Shared handle to a `DomainEventBus`, the form every component that
/// needs to publish or subscribe actually holds.
pub type SharedEventBus = Arc<DomainEventBus>;
