//! Device registry.
//!
//! Built once from the configured device rows and immutable afterwards.
//! Loading is fail-closed: the first invalid row aborts the whole load, a
//! partially valid fleet is never activated.

use kiosklink_core::{ConfigError, DeviceRow};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// One registered device. Immutable after load.
#[derive(Debug, Clone)]
pub struct Device {
    /// Stable key derived from the display name. Used in store paths and as
    /// registry key.
    pub key: String,
    /// Original display name.
    pub name: String,
    /// IPv4 address on the local network.
    pub address: Ipv4Addr,
    /// Scheme for the poll channel ("http" or "https").
    pub protocol: String,
    /// Port of the remote-control endpoint.
    pub port: u16,
    /// Poll-channel password.
    pub password: String,
    /// Disabled devices keep their observable tree but get no transports.
    pub enabled: bool,
}

impl Device {
    /// Base URL of the device's remote-control endpoint.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}/", self.protocol, self.address, self.port)
    }
}

/// Sanitize a display name into a stable device key.
///
/// Forbidden characters are stripped, dots removed, whitespace collapsed and
/// turned into underscores. Returns an empty string when nothing usable is
/// left, which the registry treats as a fatal row.
pub fn sanitize_key(name: &str) -> String {
    const FORBIDDEN: &[char] = &[
        '[', ']', '*', ',', ';', '\'', '"', '`', '<', '>', '\\', '?',
    ];

    let cleaned: String = name
        .chars()
        .filter(|c| !FORBIDDEN.contains(c) && *c != '.')
        .collect();

    let key = cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");

    // A name made of nothing but separators sanitizes to underscores only.
    if key.chars().all(|c| c == '_') {
        return String::new();
    }
    key
}

/// Immutable lookup table for the configured fleet.
pub struct DeviceRegistry {
    by_key: HashMap<String, Arc<Device>>,
    by_address: HashMap<Ipv4Addr, Arc<Device>>,
}

impl DeviceRegistry {
    /// Validate the configured rows and build the registry.
    pub fn load(rows: &[DeviceRow]) -> Result<Self, ConfigError> {
        if rows.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let mut by_key: HashMap<String, Arc<Device>> = HashMap::new();
        let mut by_address: HashMap<Ipv4Addr, Arc<Device>> = HashMap::new();

        for row in rows {
            let name = row.name.trim();
            if name.is_empty() {
                return Err(ConfigError::EmptyName);
            }

            let key = sanitize_key(name);
            if key.is_empty() {
                return Err(ConfigError::InvalidKey(name.to_string()));
            }
            if by_key.contains_key(&key) {
                return Err(ConfigError::DuplicateKey { key });
            }

            let address: Ipv4Addr =
                row.ip
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidAddress {
                        name: name.to_string(),
                        address: row.ip.clone(),
                    })?;
            if by_address.contains_key(&address) {
                return Err(ConfigError::DuplicateAddress {
                    address: address.to_string(),
                });
            }

            if row.password.is_empty() {
                return Err(ConfigError::EmptyPassword(name.to_string()));
            }

            let device = Arc::new(Device {
                key: key.clone(),
                name: name.to_string(),
                address,
                protocol: row.protocol.clone(),
                port: row.port,
                password: row.password.clone(),
                enabled: row.enabled,
            });

            by_key.insert(key, device.clone());
            by_address.insert(address, device);
        }

        if !by_key.values().any(|d| d.enabled) {
            return Err(ConfigError::NoEnabledDevices);
        }

        Ok(Self { by_key, by_address })
    }

    pub fn by_key(&self, key: &str) -> Option<Arc<Device>> {
        self.by_key.get(key).cloned()
    }

    pub fn by_address(&self, address: Ipv4Addr) -> Option<Arc<Device>> {
        self.by_address.get(&address).cloned()
    }

    /// All registered devices, disabled ones included.
    pub fn all(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.by_key.values()
    }

    /// Devices that take part in transports and liveness.
    pub fn enabled(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.by_key.values().filter(|d| d.enabled)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
