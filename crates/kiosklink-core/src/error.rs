//! Fatal startup errors.
//!
//! Everything here aborts startup. Runtime faults (a device not answering,
//! a malformed payload) are handled locally and logged, never surfaced as
//! these variants.

use thiserror::Error;

/// Errors raised while loading and validating the bridge configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The device table is empty.
    #[error("no devices configured")]
    NoDevices,

    /// A device row has an empty display name.
    #[error("device with empty name in configuration")]
    EmptyName,

    /// Sanitizing a device name left nothing usable as a key.
    #[error("device name {0:?} reduces to an empty key after sanitization")]
    InvalidKey(String),

    /// Two device rows sanitize to the same key.
    #[error("duplicate device key {key:?}")]
    DuplicateKey { key: String },

    /// A device row carries an address that is not a valid IPv4 literal.
    #[error("device {name:?} has invalid address {address:?}")]
    InvalidAddress { name: String, address: String },

    /// Two device rows share the same address.
    #[error("duplicate device address {address:?}")]
    DuplicateAddress { address: String },

    /// A device row has an empty poll password.
    #[error("device {0:?} has an empty password")]
    EmptyPassword(String),

    /// Every configured device is disabled.
    #[error("no enabled devices in configuration")]
    NoEnabledDevices,
}
