//! Session creation from an authenticated MQTT credential set, and the
//! bounded registry of live sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

/// The reserved session id that always authorizes, used for the core's
/// own internal/local MQTT connections.
pub const ALLOW_ALL_SESSION_ID: &str = "ALLOW_ALL";

/// The MQTT credential set a connection authenticates with.
#[derive(Debug, Clone)]
pub struct MqttCredentials {
    /// MQTT client id.
    pub client_id: String,
    /// MQTT username, if supplied.
    pub username: Option<String>,
    /// MQTT password, if supplied.
    pub password: Option<String>,
    /// The client certificate presented during the TLS handshake, PEM
    /// encoded.
    pub certificate_pem: Option<String>,
}

/// An authenticated session: an id plus the attribute namespace policy
/// evaluation reads from (`Thing.ThingName`, `CertificateId`,
/// `Component`).
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque session id, or `ALLOW_ALL_SESSION_ID` for the pseudo-session.
    pub session_id: String,
    /// Session attributes populated at creation time.
    pub attributes: HashMap<String, String>,
}

impl Session {
    /// The special always-authorizing pseudo-session.
    pub fn allow_all() -> Self {
        Self { session_id: ALLOW_ALL_SESSION_ID.to_string(), attributes: HashMap::new() }
    }

    /// Whether this is the always-authorizing pseudo-session.
    pub fn is_allow_all(&self) -> bool {
        self.session_id == ALLOW_ALL_SESSION_ID
    }

    /// Whether this session carries a Greengrass component credential.
    pub fn is_component(&self) -> bool {
        self.attributes.get("Component").map(String::as_str) == Some("true")
    }

    /// Read an attribute by name.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Outcome of attempting to associate a credential set with a Thing and
/// certificate, handed to `SessionManager::create_session` by the caller
/// that already ran `VerifyIdentityPipeline`.
pub struct SessionIdentity {
    /// The verified Thing name, if the certificate's attachment was
    /// confirmed.
    pub thing_name: Option<String>,
    /// The presented certificate's id, if a certificate was presented.
    pub certificate_id: Option<String>,
    /// Whether the credential is a Greengrass component certificate.
    pub is_component: bool,
    /// The Thing's cloud-reported attribute map (from
    /// `IotAuthClient::get_thing_attributes`, fetched by the caller
    /// before constructing this), folded into the session under the
    /// `Thing.Attributes.*` namespace so device-group selection rules can
    /// match on arbitrary Thing attributes, not just `Thing.ThingName`.
    pub thing_attributes: HashMap<String, String>,
}

/// Bounded registry of live sessions. `max_sessions` caps the number of
/// concurrently retained non-pseudo sessions; creating past the cap
/// evicts the oldest session (LRU-by-creation-order, not by last use).
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    order: RwLock<VecDeque<String>>,
    max_sessions: usize,
}

impl SessionManager {
    /// Construct an empty manager capped at `max_sessions`.
    pub fn new(max_sessions: usize) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), order: RwLock::new(VecDeque::new()), max_sessions }
    }

    /// Create a session for `credentials`, populated per `identity`.
    pub fn create_session(&self, _credentials: &MqttCredentials, identity: SessionIdentity) -> Arc<Session> {
        let mut attributes = HashMap::new();
        if let Some(thing_name) = identity.thing_name {
            attributes.insert("Thing.ThingName".to_string(), thing_name);
        }
        if let Some(certificate_id) = identity.certificate_id {
            attributes.insert("CertificateId".to_string(), certificate_id);
        }
        if identity.is_component {
            attributes.insert("Component".to_string(), "true".to_string());
        }
        for (key, value) in identity.thing_attributes {
            attributes.insert(format!("Thing.Attributes.{key}"), value);
        }

        let session = Arc::new(Session { session_id: Uuid::new_v4().to_string(), attributes });
        self.insert(session.clone());
        session
    }

    fn insert(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.write().unwrap();
        let mut order = self.order.write().unwrap();
        while sessions.len() >= self.max_sessions {
            let Some(oldest) = order.pop_front() else { break };
            sessions.remove(&oldest);
        }
        order.push_back(session.session_id.clone());
        sessions.insert(session.session_id.clone(), session);
    }

    /// Look up a session by id. The reserved `ALLOW_ALL_SESSION_ID`
    /// always resolves, even if never explicitly created.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        if session_id == ALLOW_ALL_SESSION_ID {
            return Some(Arc::new(Session::allow_all()));
        }
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Remove a session, e.g. on MQTT disconnect.
    pub fn remove(&self, session_id: &str) {
        self.sessions.write().unwrap().remove(session_id);
        self.order.write().unwrap().retain(|id| id != session_id);
    }

    /// Number of currently retained sessions (excluding the pseudo-session).
    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> MqttCredentials {
        MqttCredentials { client_id: "device-1".to_string(), username: None, password: None, certificate_pem: None }
    }

    #[test]
    fn allow_all_resolves_without_being_created() {
        let manager = SessionManager::new(10);
        let session = manager.get(ALLOW_ALL_SESSION_ID).unwrap();
        assert!(session.is_allow_all());
    }

    #[test]
    fn created_session_carries_thing_and_certificate_attributes() {
        let manager = SessionManager::new(10);
        let identity = SessionIdentity {
            thing_name: Some("living-room-sensor".to_string()),
            certificate_id: Some("abc123".to_string()),
            is_component: false,
            thing_attributes: HashMap::new(),
        };
        let session = manager.create_session(&credentials(), identity);
        assert_eq!(session.attribute("Thing.ThingName"), Some("living-room-sensor"));
        assert_eq!(session.attribute("CertificateId"), Some("abc123"));
        assert!(!session.is_component());
    }

    #[test]
    fn creating_past_the_cap_evicts_the_oldest_session() {
        let manager = SessionManager::new(2);
        let identity = || SessionIdentity { thing_name: None, certificate_id: None, is_component: false, thing_attributes: HashMap::new() };
        let first = manager.create_session(&credentials(), identity());
        manager.create_session(&credentials(), identity());
        manager.create_session(&credentials(), identity());

        assert_eq!(manager.active_count(), 2);
        assert!(manager.get(&first.session_id).is_none());
    }

    #[test]
    fn cloud_reported_thing_attributes_are_namespaced_for_selection_rules() {
        let manager = SessionManager::new(10);
        let mut thing_attributes = HashMap::new();
        thing_attributes.insert("deviceGroup".to_string(), "sensors".to_string());
        let identity = SessionIdentity {
            thing_name: Some("living-room-sensor".to_string()),
            certificate_id: None,
            is_component: false,
            thing_attributes,
        };
        let session = manager.create_session(&credentials(), identity);
        assert_eq!(session.attribute("Thing.Attributes.deviceGroup"), Some("sensors"));
    }
}
