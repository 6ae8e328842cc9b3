//! Embedded MQTT broker.
//!
//! The push channel runs over an in-process rumqttd broker, so no external
//! broker installation is needed. The broker itself only moves packets; all
//! bridge semantics live in the gateway, which is fed through a local
//! broker link subscribed to every topic.
//!
//! Devices publish their info and event packets with their own device id as
//! the last topic segment, which is what identifies the session on this
//! transport.

use crate::gateway::SessionEvent;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tokio::sync::mpsc;

/// Embedded broker error type.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Configuration for the embedded broker.
#[derive(Debug, Clone)]
pub struct EmbeddedBrokerConfig {
    pub listen: String,
    pub port: u16,
    pub max_connections: usize,
    pub max_payload_size: usize,
    pub connection_timeout_ms: u16,
    /// Username and password every connecting device must present. `None`
    /// disables the broker-level credential check.
    pub auth: Option<(String, String)>,
}

impl Default for EmbeddedBrokerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0".to_string(),
            port: 1886,
            max_connections: 1000,
            max_payload_size: 1048576,
            connection_timeout_ms: 60000,
            auth: None,
        }
    }
}

impl EmbeddedBrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Require this username/password pair from every connecting device.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    /// Full socket address to bind.
    pub fn socket_addr(&self) -> Result<SocketAddr, BrokerError> {
        format!("{}:{}", self.listen, self.port)
            .parse()
            .map_err(|e| BrokerError::Config(format!("invalid address: {e}")))
    }
}

/// Embedded MQTT broker handle.
pub struct EmbeddedBroker {
    config: EmbeddedBrokerConfig,
    running: Arc<AtomicBool>,
}

impl EmbeddedBroker {
    pub fn new(config: EmbeddedBrokerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &EmbeddedBrokerConfig {
        &self.config
    }

    /// Start the broker in a background thread and feed decoded publishes
    /// into `events`.
    pub fn start(&self, events: mpsc::Sender<SessionEvent>) -> Result<(), BrokerError> {
        if self.is_running() {
            tracing::warn!("embedded broker is already running");
            return Ok(());
        }

        if !is_port_available(self.config.port) {
            return Err(BrokerError::Broker(format!(
                "port {} is already in use, pick a different broker port",
                self.config.port
            )));
        }

        let addr = self.config.socket_addr()?;
        let running = Arc::clone(&self.running);

        let mut broker_config = rumqttd::Config {
            id: 0,
            router: rumqttd::RouterConfig {
                max_connections: self.config.max_connections,
                max_outgoing_packet_count: 200,
                max_segment_size: 1048576,
                max_segment_count: 10,
                custom_segment: None,
                initialized_filters: None,
                ..Default::default()
            },
            v4: None,
            v5: None,
            ws: None,
            cluster: None,
            console: None,
            bridge: None,
            prometheus: None,
            metrics: None,
        };

        let mut v4_config = HashMap::new();
        v4_config.insert(
            "main".to_string(),
            rumqttd::ServerSettings {
                name: "kiosklink-broker".to_string(),
                listen: addr,
                tls: None,
                next_connection_delay_ms: 1,
                connections: rumqttd::ConnectionSettings {
                    connection_timeout_ms: self.config.connection_timeout_ms,
                    max_payload_size: self.config.max_payload_size,
                    max_inflight_count: 200,
                    auth: self.config.auth.clone().map(|(username, password)| {
                        let mut logins = HashMap::new();
                        logins.insert(username, password);
                        logins
                    }),
                    external_auth: None,
                    dynamic_filters: true,
                },
            },
        );
        broker_config.v4 = Some(v4_config);

        let mut broker = rumqttd::Broker::new(broker_config);

        // The local link sees every publish before spawning the broker
        // loop, so nothing is missed during startup.
        let (mut link_tx, mut link_rx) = broker
            .link("kiosklink-gateway")
            .map_err(|e| BrokerError::Broker(e.to_string()))?;
        link_tx
            .subscribe("#")
            .map_err(|e| BrokerError::Broker(e.to_string()))?;

        running.store(true, Ordering::Relaxed);

        let broker_running = Arc::clone(&running);
        thread::Builder::new()
            .name("kiosklink-broker".to_string())
            .spawn(move || {
                tracing::info!(%addr, "starting embedded MQTT broker");
                match broker.start() {
                    Ok(_) => tracing::info!("embedded MQTT broker stopped"),
                    Err(e) => tracing::error!("embedded MQTT broker error: {e}"),
                }
                broker_running.store(false, Ordering::Relaxed);
            })?;

        thread::Builder::new()
            .name("kiosklink-broker-link".to_string())
            .spawn(move || loop {
                match link_rx.recv() {
                    Ok(Some(notification)) => {
                        if let Some(event) = decode_notification(notification) {
                            if events.blocking_send(event).is_err() {
                                tracing::debug!("gateway queue closed, broker link stopping");
                                return;
                            }
                        }
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::error!("broker link error: {e}");
                        return;
                    }
                }
            })?;

        tracing::info!(port = self.config.port, "embedded broker started");
        Ok(())
    }
}

/// Convert a broker notification into a gateway session event.
fn decode_notification(notification: rumqttd::Notification) -> Option<SessionEvent> {
    match notification {
        rumqttd::Notification::Forward(forward) => {
            let publish = forward.publish;
            let topic = String::from_utf8_lossy(&publish.topic).into_owned();
            let session_id = session_id_from_topic(&topic)?;
            // `Publish::qos` is `pub(crate)` in rumqttd; recover it from the
            // MQTT fixed-header byte emitted by the public `serialize()`.
            let qos = rumqttd::protocol::qos((publish.serialize()[0] >> 1) & 0b11)
                .unwrap_or(rumqttd::protocol::QoS::AtMostOnce);
            Some(SessionEvent::Publish {
                session_id,
                topic,
                qos: qos_level(qos),
                retained: publish.retain,
                payload: publish.payload.to_vec(),
            })
        }
        _ => None,
    }
}

fn qos_level(qos: rumqttd::protocol::QoS) -> u8 {
    match qos {
        rumqttd::protocol::QoS::AtMostOnce => 0,
        rumqttd::protocol::QoS::AtLeastOnce => 1,
        rumqttd::protocol::QoS::ExactlyOnce => 2,
    }
}

/// The device-reported id is the last topic segment on both the info and
/// the event topic.
fn session_id_from_topic(topic: &str) -> Option<String> {
    topic
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Whether a port can still be bound locally.
pub fn is_port_available(port: u16) -> bool {
    use std::net::{IpAddr, Ipv4Addr, TcpListener};

    TcpListener::bind((IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EmbeddedBrokerConfig::default();
        assert_eq!(config.listen, "0.0.0.0");
        assert_eq!(config.port, 1886);
    }

    #[test]
    fn config_builder() {
        let config = EmbeddedBrokerConfig::new()
            .with_port(2883)
            .with_listen("127.0.0.1");
        assert_eq!(config.port, 2883);
        assert_eq!(config.listen, "127.0.0.1");
        assert!(config.auth.is_none());
    }

    #[test]
    fn builder_carries_credentials() {
        let config = EmbeddedBrokerConfig::new().with_auth("device", "secret");
        assert_eq!(
            config.auth,
            Some(("device".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn socket_addr() {
        let config = EmbeddedBrokerConfig::new().with_listen("0.0.0.0").with_port(1886);
        let addr = config.socket_addr().expect("socket addr");
        assert_eq!(addr.port(), 1886);
    }

    #[test]
    fn session_id_comes_from_last_topic_segment() {
        assert_eq!(
            session_id_from_topic("fully/deviceInfo/abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            session_id_from_topic("fully/event/screenOn/abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(session_id_from_topic("trailing/"), None);
    }
}
