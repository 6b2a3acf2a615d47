//! Connectivity-info shadow state machine: keeps server-certificate SAN
//! lists in sync with the cloud-reported address set via a named shadow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use tokio::sync::Notify;

use crate::ports::iot_auth::IotAuthClient;
use crate::ports::shadow_client::{ShadowClient, ShadowEvent, ShadowEventSink};
use crate::rotation::engine::CertificateRotationEngine;

const BACKOFF_BASE: StdDuration = StdDuration::from_secs(1);
const BACKOFF_CAP: StdDuration = StdDuration::from_secs(30);

/// The machine's current lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    /// No subscription established; nothing is processed.
    Unsubscribed,
    /// Subscribe is in flight (retrying on failure).
    Subscribing,
    /// Subscribed, no task currently being processed.
    Idle,
    /// A task is being processed.
    ProcessingVersion,
}

#[derive(Debug, Clone)]
struct PendingTask {
    shadow_version: u64,
    cis_version: String,
    desired_state: serde_json::Value,
}

fn version_key(task: &PendingTask) -> (u64, &str) {
    (task.shadow_version, task.cis_version.as_str())
}

fn is_newer(candidate: (u64, &str), baseline: (u64, &str)) -> bool {
    candidate.0 > baseline.0 || (candidate.0 == baseline.0 && candidate.1 != baseline.1)
}

/// Drives one Thing's `-gci` named shadow: subscribes on network-up,
/// coalesces incoming versions down to the latest while a task is being
/// processed, and advances certificates' SAN sets through the rotation
/// engine's connectivity trigger when the reported address set changes.
pub struct ConnectivityShadowMachine {
    thing_name: String,
    shadow_client: Arc<dyn ShadowClient>,
    iot_auth: Arc<dyn IotAuthClient>,
    rotation_engine: Arc<CertificateRotationEngine>,
    mqtt_get_timeout: StdDuration,
    state: Mutex<ShadowState>,
    next: Mutex<Option<PendingTask>>,
    last_processed: Mutex<Option<(u64, String)>>,
    last_addresses: Mutex<Option<Vec<String>>>,
    cancelled: AtomicBool,
    get_response: Notify,
}

impl ConnectivityShadowMachine {
    /// Construct a machine for `thing_name`'s shadow. `mqtt_operation_timeout`
    /// is the configured MQTT operation timeout; the effective get-response
    /// wait is that value plus 5s of slack, per the documented deadline.
    pub fn new(
        thing_name: String,
        shadow_client: Arc<dyn ShadowClient>,
        iot_auth: Arc<dyn IotAuthClient>,
        rotation_engine: Arc<CertificateRotationEngine>,
        mqtt_operation_timeout: StdDuration,
    ) -> Arc<Self> {
        Arc::new(Self {
            thing_name,
            shadow_client,
            iot_auth,
            rotation_engine,
            mqtt_get_timeout: mqtt_operation_timeout + StdDuration::from_secs(5),
            state: Mutex::new(ShadowState::Unsubscribed),
            next: Mutex::new(None),
            last_processed: Mutex::new(None),
            last_addresses: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            get_response: Notify::new(),
        })
    }

    /// Current lifecycle state, for diagnostics and tests.
    pub fn state(&self) -> ShadowState {
        *self.state.lock().unwrap()
    }

    /// Handle a network-up transition: subscribe (retrying with backoff)
    /// then publish a `get`, retrying indefinitely on timeout until
    /// network-down cancels it.
    pub async fn on_network_up(self: &Arc<Self>) {
        self.cancelled.store(false, Ordering::SeqCst);
        *self.state.lock().unwrap() = ShadowState::Subscribing;

        if !self.subscribe_with_backoff().await {
            return;
        }
        *self.state.lock().unwrap() = ShadowState::Idle;
        self.get_with_retry().await;
    }

    /// Handle a network-down transition: cancel retries, unsubscribe, and
    /// drop any queued-but-unprocessed task.
    pub async fn on_network_down(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.shadow_client.unsubscribe(&self.thing_name).await;
        *self.next.lock().unwrap() = None;
        *self.state.lock().unwrap() = ShadowState::Unsubscribed;
    }

    async fn subscribe_with_backoff(self: &Arc<Self>) -> bool {
        let sink: Arc<dyn ShadowEventSink> = self.clone();
        let mut delay = BACKOFF_BASE;
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            match self.shadow_client.subscribe(&self.thing_name, sink.clone()).await {
                Ok(()) => return true,
                Err(error) => {
                    tracing::warn!(thing_name = %self.thing_name, %error, "shadow subscribe failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    async fn get_with_retry(&self) {
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }
            if let Err(error) = self.shadow_client.publish_get(&self.thing_name).await {
                tracing::warn!(thing_name = %self.thing_name, %error, "shadow get publish failed, retrying");
                continue;
            }
            let timed_out = tokio::time::timeout(self.mqtt_get_timeout, self.get_response.notified()).await.is_err();
            if timed_out {
                tracing::warn!(thing_name = %self.thing_name, "shadow get response timed out, retrying");
                continue;
            }
            return;
        }
    }

    /// Drain the coalesced queue: processes at most one task (whatever is
    /// currently queued as "next" when called), advancing
    /// `last_processed` even if the publish step fails. Intended to be
    /// called repeatedly by the shadow worker.
    pub async fn drain_next(&self) {
        loop {
            let Some(task) = self.next.lock().unwrap().take() else { return };
            *self.state.lock().unwrap() = ShadowState::ProcessingVersion;
            self.process_task(task).await;
            *self.state.lock().unwrap() = ShadowState::Idle;
        }
    }

    async fn process_task(&self, task: PendingTask) {
        let prev_addresses = self.last_addresses.lock().unwrap().clone();

        let connectivity = self.fetch_connectivity_with_retry().await;
        match connectivity {
            None => {
                self.publish_reported(&task).await;
            }
            Some(info) if Some(&info.addresses) == prev_addresses.as_ref() => {
                self.publish_reported(&task).await;
            }
            Some(info) => {
                self.rotation_engine.on_connectivity_changed(info.addresses.clone());
                *self.last_addresses.lock().unwrap() = Some(info.addresses);
                self.publish_reported(&task).await;
            }
        }

        *self.last_processed.lock().unwrap() = Some((task.shadow_version, task.cis_version.clone()));
    }

    async fn publish_reported(&self, task: &PendingTask) {
        if let Err(error) = self.shadow_client.publish_reported(&self.thing_name, task.desired_state.clone()).await {
            tracing::warn!(thing_name = %self.thing_name, %error, "shadow publish reported failed");
        }
    }

    async fn fetch_connectivity_with_retry(&self) -> Option<crate::ports::iot_auth::ConnectivityInfo> {
        let mut delay = BACKOFF_BASE;
        loop {
            match self.iot_auth.get_connectivity_info(&self.thing_name).await {
                Ok(info) => return info,
                Err(error) if error.is_retryable() => {
                    tracing::warn!(thing_name = %self.thing_name, %error, "connectivity info fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
                Err(error) => {
                    tracing::warn!(thing_name = %self.thing_name, %error, "connectivity info fetch failed, not retrying");
                    return None;
                }
            }
        }
    }

    fn offer(&self, task: PendingTask) {
        let candidate_key = (task.shadow_version, task.cis_version.as_str());
        if let Some(baseline) = self.last_processed.lock().unwrap().as_ref() {
            if !is_newer(candidate_key, (baseline.0, baseline.1.as_str())) {
                return;
            }
        }

        let mut next = self.next.lock().unwrap();
        let should_replace = match next.as_ref() {
            None => true,
            Some(existing) => is_newer(version_key(&task), version_key(existing)),
        };
        if should_replace {
            *next = Some(task);
        }
    }
}

impl ShadowEventSink for ConnectivityShadowMachine {
    fn on_shadow_state(&self, event: ShadowEvent) {
        self.offer(PendingTask {
            shadow_version: event.shadow_version,
            cis_version: event.cis_version,
            desired_state: event.desired_state,
        });
        self.get_response.notify_waiters();
    }

    fn on_get_rejected(&self, code: u32, message: String) {
        tracing::warn!(thing_name = %self.thing_name, code, message, "shadow get rejected");
        self.get_response.notify_waiters();
    }
}
