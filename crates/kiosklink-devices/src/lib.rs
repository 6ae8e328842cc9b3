//! Device-facing side of the KioskLink bridge.
//!
//! Bridges a fleet of kiosk tablets to the state database over two
//! unreliable channels: an embedded-broker push channel for telemetry and
//! events, and a synchronous HTTP poll channel for commands and queries.
//! The heart of the crate is the liveness engine that derives one boolean
//! verdict per device from both channels.

pub mod broker;
pub mod classify;
pub mod commands;
pub mod dispatch;
pub mod gateway;
pub mod liveness;
pub mod paths;
pub mod registry;
pub mod rest;
pub mod service;
pub mod session;

pub use broker::{BrokerError, EmbeddedBroker, EmbeddedBrokerConfig};
pub use classify::MessageClass;
pub use commands::{CommandDescriptor, CommandKind, SwitchPairDescriptor};
pub use dispatch::{CommandDispatcher, DispatchError};
pub use gateway::{AuthDecision, Credentials, GatewayConfig, PushChannelGateway, SessionEvent};
pub use liveness::{LivenessTracker, LivenessVerdict, WATCHDOG_WINDOW};
pub use registry::{Device, DeviceRegistry};
pub use rest::{HttpFetch, PollClient, PollError, PollScheduler, ReqwestFetch};
pub use service::{BridgeService, ServiceError};
pub use session::SessionTable;
