//! Push-channel gateway.
//!
//! Consumes already-decoded session events (connects, publishes,
//! disconnects, errors) from whatever transport feeds the broker, applies
//! authentication and classification, and turns accepted traffic into bus
//! events. Per-session ordering comes from the single mpsc queue the actor
//! drains; nothing here blocks on network I/O.
//!
//! Every per-message failure is handled and logged locally. The gateway
//! never tears itself down over one bad packet.

use crate::classify::{self, MessageClass};
use crate::liveness::LivenessTracker;
use crate::registry::DeviceRegistry;
use crate::session::SessionTable;
use kiosklink_core::{BridgeEvent, EventBus};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Sentinel event every device fires right after connecting. Carries no
/// information the connect itself did not.
const CONNECT_SENTINEL_EVENT: &str = "mqttConnected";

/// Decoded push-channel traffic, one value per transport callback.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connect {
        session_id: String,
    },
    Publish {
        session_id: String,
        topic: String,
        qos: u8,
        retained: bool,
        payload: Vec<u8>,
    },
    Disconnect {
        session_id: String,
    },
    ClientError {
        session_id: String,
        message: String,
    },
    ConnectionError {
        session_id: String,
        message: String,
    },
}

/// Credentials presented by a connecting session.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Outcome of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,
}

/// Gateway tuning taken from the bridge configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Minimum interval between accepted telemetry snapshots per session.
    pub telemetry_min_interval: Duration,
    pub username: String,
    pub password: String,
    /// Accept any credentials; address authorization still applies.
    pub skip_credential_check: bool,
}

/// Parse the peer IPv4 address out of a transport-reported peer string.
///
/// Transports report peers in mixed forms (`192.168.10.101:49152`,
/// `::ffff:192.168.10.101`), so the contract is: take the text after the
/// LAST colon and require a strict IPv4 literal. Anything else means the
/// address is unknown, which is tolerated, not rejected.
pub fn peer_ipv4(peer: &str) -> Option<Ipv4Addr> {
    let tail = peer.rsplit(':').next().unwrap_or(peer);
    tail.parse().ok()
}

/// The push-channel gateway actor.
pub struct PushChannelGateway {
    registry: Arc<DeviceRegistry>,
    liveness: LivenessTracker,
    bus: EventBus,
    sessions: Mutex<SessionTable>,
    config: GatewayConfig,
}

impl PushChannelGateway {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        liveness: LivenessTracker,
        bus: EventBus,
        config: GatewayConfig,
    ) -> Self {
        Self {
            registry,
            liveness,
            bus,
            sessions: Mutex::new(SessionTable::new()),
            config,
        }
    }

    /// Drain the transport's event queue until it closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
        tracing::debug!("push-channel event queue closed, gateway stopping");
    }

    /// Authenticate a connecting session.
    ///
    /// Denylisted sessions are refused without further logging. An address
    /// that resolves to a device not enabled in the configuration is a
    /// security event: denied and permanently denylisted. An address that
    /// cannot be parsed is tolerated; the device association then arrives
    /// with the first telemetry snapshot.
    pub fn authenticate(
        &self,
        session_id: &str,
        peer_addr: Option<&str>,
        credentials: &Credentials,
    ) -> AuthDecision {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        if sessions.is_denied(session_id) {
            tracing::debug!(session = session_id, "denylisted session refused");
            return AuthDecision::Deny;
        }
        sessions.touch(session_id);

        let address = peer_addr.and_then(peer_ipv4);
        let mut resolved_key: Option<String> = None;
        if let Some(address) = address {
            match self.registry.by_address(address) {
                Some(device) if device.enabled => {
                    sessions.associate(session_id, &device.key);
                    resolved_key = Some(device.key.clone());
                }
                _ => {
                    tracing::error!(
                        session = session_id,
                        %address,
                        "unauthorized push-channel address, session denylisted"
                    );
                    sessions.deny(session_id);
                    return AuthDecision::Deny;
                }
            }
        } else {
            tracing::info!(
                session = session_id,
                "peer address unknown, authorization deferred to first telemetry"
            );
        }

        if !self.config.skip_credential_check
            && (credentials.username != self.config.username
                || credentials.password != self.config.password)
        {
            tracing::warn!(
                session = session_id,
                "push-channel credentials rejected, session denylisted"
            );
            sessions.deny(session_id);
            return AuthDecision::Deny;
        }

        drop(sessions);
        if let Some(key) = resolved_key {
            self.liveness.record_activity(&key);
        }
        tracing::info!(session = session_id, "push-channel session authenticated");
        AuthDecision::Allow
    }

    /// Process one decoded session event.
    pub fn handle(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connect { session_id } => self.on_connect(&session_id),
            SessionEvent::Publish {
                session_id,
                topic,
                qos,
                retained,
                payload,
            } => self.on_publish(&session_id, &topic, qos, retained, &payload),
            SessionEvent::Disconnect { session_id } => {
                self.on_session_down(&session_id, "disconnected", true)
            }
            SessionEvent::ClientError {
                session_id,
                message,
            } => {
                tracing::error!(session = %session_id, %message, "push-channel client error");
                self.on_session_down(&session_id, "client error", false);
            }
            SessionEvent::ConnectionError {
                session_id,
                message,
            } => {
                tracing::error!(session = %session_id, %message, "push-channel connection error");
                self.on_session_down(&session_id, "connection error", false);
            }
        }
    }

    fn on_connect(&self, session_id: &str) {
        let key = {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            if sessions.is_denied(session_id) {
                return;
            }
            sessions.touch(session_id);
            sessions.device_key(session_id).map(str::to_string)
        };

        match &key {
            Some(key) => {
                tracing::info!(session = session_id, device = %key, "session connected");
                self.liveness.record_activity(key);
            }
            None => {
                tracing::info!(
                    session = session_id,
                    "session connected, identity unknown until first telemetry"
                );
            }
        }
    }

    fn on_publish(&self, session_id: &str, topic: &str, qos: u8, retained: bool, payload: &[u8]) {
        let key = {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            if sessions.is_denied(session_id) {
                return;
            }
            sessions.touch(session_id);
            sessions.device_key(session_id).map(str::to_string)
        };

        // Any traffic from an associated session counts as activity, even
        // traffic that is dropped further down.
        if let Some(key) = &key {
            self.liveness.record_activity(key);
        }

        // The devices publish everything at QoS 1. Anything else is not
        // from a device and is dropped without comment.
        if qos != 1 {
            return;
        }

        match classify::classify(retained, payload) {
            MessageClass::Telemetry(map) => self.on_telemetry(session_id, topic, map),
            MessageClass::Event(event) => self.on_event(session_id, key.as_deref(), &event),
            MessageClass::Unclassified => {
                tracing::warn!(
                    session = session_id,
                    topic,
                    "unclassifiable publish dropped"
                );
            }
        }
    }

    fn on_telemetry(
        &self,
        session_id: &str,
        topic: &str,
        map: serde_json::Map<String, serde_json::Value>,
    ) {
        // The snapshot is authoritative for the session's identity: resolve
        // and re-confirm the address on every packet.
        let address: Option<Ipv4Addr> = map
            .get("ip4")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());
        let Some(address) = address else {
            tracing::warn!(
                session = session_id,
                topic,
                "telemetry without usable ip4 field dropped"
            );
            return;
        };

        let device = match self.registry.by_address(address) {
            Some(device) if device.enabled => device,
            _ => {
                tracing::error!(
                    session = session_id,
                    %address,
                    "telemetry from unauthorized address dropped"
                );
                return;
            }
        };

        let (first, accepted) = {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            let first = sessions.associate(session_id, &device.key);
            (
                first,
                sessions.accept_telemetry(session_id, self.config.telemetry_min_interval),
            )
        };
        if first {
            tracing::info!(
                session = session_id,
                device = %device.key,
                "session resolved to device"
            );
        }
        self.liveness.record_activity(&device.key);

        if !accepted {
            tracing::debug!(
                session = session_id,
                device = %device.key,
                "telemetry inside rate-limit window dropped"
            );
            return;
        }

        let values = classify::normalize_telemetry(map);
        self.bus
            .publish(BridgeEvent::telemetry(&device.key, values), "gateway");
    }

    fn on_event(&self, session_id: &str, device_key: Option<&str>, event: &str) {
        if event == CONNECT_SENTINEL_EVENT {
            tracing::debug!(session = session_id, "connect sentinel event disregarded");
            return;
        }

        let Some(key) = device_key else {
            tracing::info!(
                session = session_id,
                event,
                "event before first telemetry dropped, device identity unknown"
            );
            return;
        };

        self.bus
            .publish(BridgeEvent::device_event(key, event), "gateway");
    }

    fn on_session_down(&self, session_id: &str, reason: &str, remove: bool) {
        let key = {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            if sessions.is_denied(session_id) {
                return;
            }
            if remove {
                sessions.remove(session_id)
            } else {
                sessions.device_key(session_id).map(str::to_string)
            }
        };

        match key {
            Some(key) => {
                tracing::warn!(session = session_id, device = %key, reason, "session down");
                self.liveness.record_explicit_down(&key);
            }
            None => {
                tracing::debug!(session = session_id, reason, "session down, no device bound");
            }
        }
    }

    /// Number of live sessions, for diagnostics.
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .session_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::LivenessVerdict;
    use kiosklink_core::{DeviceRow, EventBusReceiver};
    use serde_json::json;

    fn row(name: &str, ip: &str, enabled: bool) -> DeviceRow {
        DeviceRow {
            name: name.to_string(),
            ip: ip.to_string(),
            protocol: "http".to_string(),
            port: 8080,
            password: "pw".to_string(),
            enabled,
        }
    }

    fn gateway() -> (Arc<PushChannelGateway>, LivenessTracker, EventBusReceiver) {
        let registry = Arc::new(
            DeviceRegistry::load(&[
                row("Tablet Kitchen", "10.0.0.6", true),
                row("Tablet Lobby", "10.0.0.7", false),
            ])
            .unwrap(),
        );
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let liveness = LivenessTracker::new(
            bus.clone(),
            registry.enabled().map(|d| d.key.clone()),
        );
        let gateway = Arc::new(PushChannelGateway::new(
            registry,
            liveness.clone(),
            bus,
            GatewayConfig {
                telemetry_min_interval: Duration::from_secs(30),
                username: "user".to_string(),
                password: "secret".to_string(),
                skip_credential_check: false,
            },
        ));
        (gateway, liveness, rx)
    }

    fn creds(username: &str, password: &str) -> Credentials {
        Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn info_packet(session: &str, ip: &str) -> SessionEvent {
        SessionEvent::Publish {
            session_id: session.to_string(),
            topic: "fully/deviceInfo/x".to_string(),
            qos: 1,
            retained: true,
            payload: serde_json::to_vec(&json!({"ip4": ip, "batteryLevel": 80})).unwrap(),
        }
    }

    fn event_packet(session: &str, event: &str) -> SessionEvent {
        SessionEvent::Publish {
            session_id: session.to_string(),
            topic: "fully/event/x".to_string(),
            qos: 1,
            retained: false,
            payload: serde_json::to_vec(&json!({"event": event, "deviceId": "d"})).unwrap(),
        }
    }

    fn drain(rx: &mut EventBusReceiver) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Some((event, _)) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn peer_address_contract() {
        assert_eq!(
            peer_ipv4("::ffff:192.168.10.101"),
            Some(Ipv4Addr::new(192, 168, 10, 101))
        );
        assert_eq!(
            peer_ipv4("10.0.0.6:49152"),
            Some(Ipv4Addr::new(10, 0, 0, 6))
        );
        assert_eq!(peer_ipv4("10.0.0.6"), Some(Ipv4Addr::new(10, 0, 0, 6)));
        assert_eq!(peer_ipv4("[2001:db8::1]:1886"), None);
        assert_eq!(peer_ipv4("garbage"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn authenticate_allows_known_address() {
        let (gateway, liveness, _rx) = gateway();
        let decision =
            gateway.authenticate("s1", Some("::ffff:10.0.0.6"), &creds("user", "secret"));
        assert_eq!(decision, AuthDecision::Allow);
        assert_eq!(
            liveness.verdict("Tablet_Kitchen"),
            Some(LivenessVerdict::Alive)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn authenticate_denylists_unknown_and_disabled_addresses() {
        let (gateway, _liveness, _rx) = gateway();

        // Disabled device address.
        assert_eq!(
            gateway.authenticate("s1", Some("10.0.0.7:1234"), &creds("user", "secret")),
            AuthDecision::Deny
        );
        // Address outside the fleet.
        assert_eq!(
            gateway.authenticate("s2", Some("10.0.0.99:1234"), &creds("user", "secret")),
            AuthDecision::Deny
        );
        // The denial is permanent, even with good credentials and address.
        assert_eq!(
            gateway.authenticate("s1", Some("10.0.0.6:1234"), &creds("user", "secret")),
            AuthDecision::Deny
        );
    }

    #[tokio::test(start_paused = true)]
    async fn authenticate_tolerates_unknown_peer_address() {
        let (gateway, _liveness, _rx) = gateway();
        assert_eq!(
            gateway.authenticate("s1", None, &creds("user", "secret")),
            AuthDecision::Allow
        );
        assert_eq!(
            gateway.authenticate("s2", Some("[::1]:1886"), &creds("user", "secret")),
            AuthDecision::Allow
        );
    }

    #[tokio::test(start_paused = true)]
    async fn authenticate_checks_credentials_unless_bypassed() {
        let (gateway, _liveness, _rx) = gateway();
        assert_eq!(
            gateway.authenticate("s1", Some("10.0.0.6:1"), &creds("user", "wrong")),
            AuthDecision::Deny
        );
        // Denylisted now, correct credentials no longer help.
        assert_eq!(
            gateway.authenticate("s1", Some("10.0.0.6:1"), &creds("user", "secret")),
            AuthDecision::Deny
        );
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_associates_and_publishes() {
        let (gateway, liveness, mut rx) = gateway();
        gateway.handle(info_packet("s1", "10.0.0.6"));

        assert_eq!(
            liveness.verdict("Tablet_Kitchen"),
            Some(LivenessVerdict::Alive)
        );
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            BridgeEvent::Telemetry { device_key, .. } if device_key == "Tablet_Kitchen"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_rate_limit_drops_but_refreshes_liveness() {
        let (gateway, liveness, mut rx) = gateway();
        gateway.handle(info_packet("s1", "10.0.0.6"));
        drain(&mut rx);

        tokio::time::advance(Duration::from_secs(10)).await;
        gateway.handle(info_packet("s1", "10.0.0.6"));

        // Dropped by the rate limiter, no telemetry event.
        let events = drain(&mut rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, BridgeEvent::Telemetry { .. })));
        // Liveness still refreshed.
        assert_eq!(
            liveness.verdict("Tablet_Kitchen"),
            Some(LivenessVerdict::Alive)
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        gateway.handle(info_packet("s1", "10.0.0.6"));
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, BridgeEvent::Telemetry { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_from_unauthorized_address_dropped() {
        let (gateway, _liveness, mut rx) = gateway();
        gateway.handle(info_packet("s1", "10.0.0.99"));
        gateway.handle(info_packet("s2", "10.0.0.7"));

        let events = drain(&mut rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, BridgeEvent::Telemetry { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn qos_other_than_one_dropped() {
        let (gateway, _liveness, mut rx) = gateway();
        let mut packet = info_packet("s1", "10.0.0.6");
        if let SessionEvent::Publish { qos, .. } = &mut packet {
            *qos = 0;
        }
        gateway.handle(packet);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn events_require_prior_association() {
        let (gateway, _liveness, mut rx) = gateway();

        // No telemetry yet: dropped.
        gateway.handle(event_packet("s1", "screenOn"));
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, BridgeEvent::DeviceEvent { .. })));

        gateway.handle(info_packet("s1", "10.0.0.6"));
        drain(&mut rx);

        gateway.handle(event_packet("s1", "screenOn"));
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            BridgeEvent::DeviceEvent { device_key, event, .. }
                if device_key == "Tablet_Kitchen" && event == "screenOn"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_sentinel_event_filtered() {
        let (gateway, _liveness, mut rx) = gateway();
        gateway.handle(info_packet("s1", "10.0.0.6"));
        drain(&mut rx);

        gateway.handle(event_packet("s1", "mqttConnected"));
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, BridgeEvent::DeviceEvent { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_marks_device_down() {
        let (gateway, liveness, _rx) = gateway();
        gateway.handle(info_packet("s1", "10.0.0.6"));
        assert_eq!(
            liveness.verdict("Tablet_Kitchen"),
            Some(LivenessVerdict::Alive)
        );

        gateway.handle(SessionEvent::Disconnect {
            session_id: "s1".to_string(),
        });
        assert_eq!(
            liveness.verdict("Tablet_Kitchen"),
            Some(LivenessVerdict::Dead)
        );
        assert_eq!(gateway.session_count(), 0);
    }
}
