//! Core building blocks for the KioskLink bridge.
//!
//! This crate carries the pieces every other crate depends on:
//! - the bridge event bus ([`EventBus`]) and its event type ([`BridgeEvent`]),
//! - the state-database contract ([`StateStore`]) plus an in-memory
//!   implementation used by tests and standalone runs,
//! - the configuration surface ([`BridgeConfig`]) with its normalization
//!   rules,
//! - the fatal startup error taxonomy ([`ConfigError`]).
//!
//! The device-facing logic (registry, liveness, gateway, poll client) lives
//! in `kiosklink-devices`.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod store;

pub use config::{BridgeConfig, DeviceRow};
pub use error::ConfigError;
pub use event::{BridgeEvent, EventMetadata};
pub use eventbus::{EventBus, EventBusReceiver};
pub use store::{MemoryStore, PointType, StateStore, StoreError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
