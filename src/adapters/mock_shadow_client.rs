//! In-memory `ShadowClient` test double.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::ports::shadow_client::{ShadowClient, ShadowError, ShadowEvent, ShadowEventSink};

/// In-memory stand-in for the MQTT shadow transport. Tests drive it by
/// calling `push_delta`/`push_get_accepted` directly.
#[derive(Default)]
pub struct MockShadowClient {
    sinks: Mutex<HashMap<String, Arc<dyn ShadowEventSink>>>,
    reported: Mutex<HashMap<String, serde_json::Value>>,
    get_calls: Mutex<Vec<String>>,
}

impl MockShadowClient {
    /// Construct an empty double.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a `delta`/`get/accepted` style event to `thing_name`'s
    /// registered sink, if one is subscribed.
    pub fn push_event(&self, thing_name: &str, event: ShadowEvent) {
        if let Some(sink) = self.sinks.lock().unwrap().get(thing_name) {
            sink.on_shadow_state(event);
        }
    }

    /// Deliver a `get/rejected` style event.
    pub fn push_rejected(&self, thing_name: &str, code: u32, message: &str) {
        if let Some(sink) = self.sinks.lock().unwrap().get(thing_name) {
            sink.on_get_rejected(code, message.to_string());
        }
    }

    /// Inspect the last reported state published for `thing_name`.
    pub fn last_reported(&self, thing_name: &str) -> Option<serde_json::Value> {
        self.reported.lock().unwrap().get(thing_name).cloned()
    }

    /// Number of `publish_get` calls made for `thing_name`.
    pub fn get_call_count(&self, thing_name: &str) -> usize {
        self.get_calls.lock().unwrap().iter().filter(|t| *t == thing_name).count()
    }

    /// Whether a sink is currently subscribed for `thing_name`.
    pub fn is_subscribed(&self, thing_name: &str) -> bool {
        self.sinks.lock().unwrap().contains_key(thing_name)
    }
}

#[async_trait]
impl ShadowClient for MockShadowClient {
    async fn subscribe(&self, thing_name: &str, sink: Arc<dyn ShadowEventSink>) -> Result<(), ShadowError> {
        self.sinks.lock().unwrap().insert(thing_name.to_string(), sink);
        Ok(())
    }

    async fn unsubscribe(&self, thing_name: &str) -> Result<(), ShadowError> {
        self.sinks.lock().unwrap().remove(thing_name);
        Ok(())
    }

    async fn publish_get(&self, thing_name: &str) -> Result<(), ShadowError> {
        self.get_calls.lock().unwrap().push(thing_name.to_string());
        Ok(())
    }

    async fn publish_reported(&self, thing_name: &str, desired_state: serde_json::Value) -> Result<(), ShadowError> {
        self.reported.lock().unwrap().insert(thing_name.to_string(), desired_state);
        Ok(())
    }
}
