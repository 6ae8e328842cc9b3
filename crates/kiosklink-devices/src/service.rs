//! Bridge orchestrator.
//!
//! Wires the registry, liveness tracker, gateway, poll client and command
//! dispatcher together, materializes the observable point tree, and runs
//! the consumer that turns bus events into store writes.

use crate::broker::{BrokerError, EmbeddedBroker, EmbeddedBrokerConfig};
use crate::commands::{self, CommandKind};
use crate::dispatch::{CommandDispatcher, DispatchError};
use crate::gateway::{GatewayConfig, PushChannelGateway};
use crate::liveness::LivenessTracker;
use crate::paths;
use crate::registry::DeviceRegistry;
use crate::rest::{HttpFetch, PollClient, PollScheduler, ReqwestFetch};
use kiosklink_core::{
    BridgeConfig, BridgeEvent, ConfigError, EventBus, PointType, StateStore, StoreError,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the transport-to-gateway queue.
const GATEWAY_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The running bridge.
pub struct BridgeService {
    config: BridgeConfig,
    registry: Arc<DeviceRegistry>,
    bus: EventBus,
    liveness: LivenessTracker,
    gateway: Arc<PushChannelGateway>,
    client: Arc<PollClient>,
    dispatcher: Arc<CommandDispatcher>,
    store: Arc<dyn StateStore>,
    broker: EmbeddedBroker,
    scheduler: Mutex<Option<PollScheduler>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeService {
    /// Build the bridge with the real HTTP transport.
    pub fn new(config: BridgeConfig, store: Arc<dyn StateStore>) -> Result<Self, ConfigError> {
        Self::with_fetch(config, store, Arc::new(ReqwestFetch::new()))
    }

    /// Build the bridge with an injected poll transport.
    pub fn with_fetch(
        mut config: BridgeConfig,
        store: Arc<dyn StateStore>,
        fetch: Arc<dyn HttpFetch>,
    ) -> Result<Self, ConfigError> {
        config.normalize();
        let registry = Arc::new(DeviceRegistry::load(&config.devices)?);
        let bus = EventBus::new();
        let liveness = LivenessTracker::new(
            bus.clone(),
            registry.enabled().map(|d| d.key.clone()),
        );
        let gateway = Arc::new(PushChannelGateway::new(
            Arc::clone(&registry),
            liveness.clone(),
            bus.clone(),
            GatewayConfig {
                telemetry_min_interval: config.telemetry_min_interval(),
                username: config.broker_username.clone(),
                password: config.broker_password.clone(),
                skip_credential_check: config.skip_credential_check,
            },
        ));
        let client = Arc::new(PollClient::new(
            fetch,
            liveness.clone(),
            config.poll_timeout(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&client),
            Arc::clone(&store),
        ));
        let mut broker_config = EmbeddedBrokerConfig::new()
            .with_listen(config.broker_listen.clone())
            .with_port(config.broker_port);
        // Credential enforcement happens at the broker accept path; the
        // gateway only sees already-admitted sessions.
        if !config.skip_credential_check && !config.broker_username.is_empty() {
            broker_config = broker_config.with_auth(
                config.broker_username.clone(),
                config.broker_password.clone(),
            );
        }
        let broker = EmbeddedBroker::new(broker_config);

        Ok(Self {
            config,
            registry,
            bus,
            liveness,
            gateway,
            client,
            dispatcher,
            store,
            broker,
            scheduler: Mutex::new(None),
            consumer: Mutex::new(None),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<PushChannelGateway> {
        &self.gateway
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    pub fn poll_client(&self) -> &Arc<PollClient> {
        &self.client
    }

    pub fn broker(&self) -> &EmbeddedBroker {
        &self.broker
    }

    /// Full startup: point tree, cleanup, consumer, broker, poll scheduler.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.initialize().await?;
        self.spawn_consumer();

        let (tx, rx) = mpsc::channel(GATEWAY_QUEUE_CAPACITY);
        self.broker.start(tx)?;
        tokio::spawn(Arc::clone(&self.gateway).run(rx));

        let scheduler = PollScheduler::start(
            Arc::clone(&self.client),
            self.bus.clone(),
            self.registry.enabled().cloned().collect(),
            self.config.poll_interval(),
        );
        *self.scheduler.lock().expect("scheduler lock poisoned") = Some(scheduler);

        tracing::info!(
            devices = self.registry.len(),
            enabled = self.registry.enabled().count(),
            port = self.config.broker_port,
            "bridge started"
        );
        Ok(())
    }

    /// Materialize the observable tree and clean up removed devices.
    pub async fn initialize(&self) -> Result<(), ServiceError> {
        for device in self.registry.all() {
            self.materialize_device(device.key.as_str(), &device.name, device.enabled)
                .await?;
        }
        self.store
            .upsert_point(paths::FLEET_ALL_ALIVE, PointType::Boolean, "All devices alive")
            .await?;
        self.cleanup_removed_devices().await?;
        Ok(())
    }

    async fn materialize_device(
        &self,
        key: &str,
        name: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let store = &self.store;
        store.upsert_point(key, PointType::Channel, name).await?;
        store
            .upsert_point(&paths::alive(key), PointType::Boolean, "Is device alive?")
            .await?;
        store
            .upsert_point(&paths::enabled(key), PointType::Boolean, "Enabled in configuration")
            .await?;
        store
            .upsert_point(
                &paths::last_info_update(key),
                PointType::Number,
                "Last information update",
            )
            .await?;

        for switch in commands::SWITCHES {
            store
                .upsert_point(
                    &paths::command(key, switch.id),
                    PointType::Boolean,
                    switch.name,
                )
                .await?;
        }
        for command in commands::COMMANDS {
            let point_type = match command.kind {
                CommandKind::Button => PointType::Boolean,
                CommandKind::Text => PointType::Text,
                CommandKind::Number => PointType::Number,
            };
            store
                .upsert_point(&paths::command(key, command.id), point_type, command.name)
                .await?;
        }

        if self.config.create_default_event_points {
            for event in commands::KNOWN_EVENTS {
                store
                    .upsert_point(&paths::event(key, event), PointType::Boolean, event)
                    .await?;
            }
        }

        store
            .write_value(&paths::enabled(key), Value::Bool(enabled), true)
            .await?;
        if !enabled {
            // Disabled devices keep their tree, but their verdict is void.
            store
                .write_value(&paths::alive(key), Value::Null, true)
                .await?;
        }
        Ok(())
    }

    /// Delete subtrees of devices that were removed or renamed in the
    /// configuration. Disabled devices are kept.
    pub async fn cleanup_removed_devices(&self) -> Result<(), StoreError> {
        let keep: HashSet<&str> = self
            .registry
            .all()
            .map(|d| d.key.as_str())
            .chain(paths::RESERVED_ROOTS.iter().copied())
            .collect();

        for root in self.store.roots().await? {
            if !keep.contains(root.as_str()) {
                tracing::info!(device = %root, "removing objects of device no longer configured");
                self.store.delete_tree(&root).await?;
            }
        }
        Ok(())
    }

    /// Run the bus consumer that reconciles events into the store.
    pub fn spawn_consumer(&self) {
        let mut rx = self.bus.subscribe();
        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let update_unchanged = self.config.update_unchanged_values;

        let handle = tokio::spawn(async move {
            // Grows monotonically; avoids re-upserting known info points on
            // every snapshot.
            let mut known_info_keys: HashMap<String, HashSet<String>> = HashMap::new();

            while let Some((event, _meta)) = rx.recv().await {
                let result = match event {
                    BridgeEvent::Telemetry {
                        device_key, values, ..
                    } => {
                        apply_telemetry(
                            &*store,
                            &mut known_info_keys,
                            &device_key,
                            values,
                            update_unchanged,
                        )
                        .await
                    }
                    BridgeEvent::DeviceEvent {
                        device_key, event, ..
                    } => apply_device_event(&*store, &dispatcher, &device_key, &event).await,
                    BridgeEvent::AliveChanged {
                        device_key, alive, ..
                    } => {
                        store
                            .write_value(&paths::alive(&device_key), Value::Bool(alive), true)
                            .await
                    }
                    BridgeEvent::FleetHealthChanged { all_alive, .. } => {
                        store
                            .write_value_if_changed(
                                paths::FLEET_ALL_ALIVE,
                                Value::Bool(all_alive),
                                true,
                            )
                            .await
                    }
                };
                if let Err(err) = result {
                    tracing::error!(%err, "store write failed while applying bridge event");
                }
            }
            tracing::debug!("bridge event consumer stopped");
        });

        *self.consumer.lock().expect("consumer lock poisoned") = Some(handle);
    }

    /// Execute a command intent against a device.
    pub async fn dispatch(
        &self,
        device_key: &str,
        command_id: &str,
        value: &Value,
    ) -> Result<(), DispatchError> {
        self.dispatcher.dispatch(device_key, command_id, value).await
    }

    /// Tear the bridge down: stop timers, mark the fleet dead, void the
    /// stored verdicts.
    pub async fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.lock().expect("scheduler lock poisoned").take() {
            scheduler.stop();
        }
        self.liveness.shutdown();
        if let Some(handle) = self.consumer.lock().expect("consumer lock poisoned").take() {
            handle.abort();
        }

        for device in self.registry.enabled() {
            if let Err(err) = self
                .store
                .write_value(&paths::alive(&device.key), Value::Null, true)
                .await
            {
                tracing::error!(device = %device.key, %err, "could not void alive state");
            }
        }
        tracing::info!("bridge stopped");
    }
}

async fn apply_telemetry(
    store: &dyn StateStore,
    known_info_keys: &mut HashMap<String, HashSet<String>>,
    device_key: &str,
    values: serde_json::Map<String, Value>,
    update_unchanged: bool,
) -> Result<(), StoreError> {
    let known = known_info_keys.entry(device_key.to_string()).or_default();

    for (field, value) in &values {
        if !known.contains(field) {
            store
                .upsert_point(
                    &paths::info(device_key, field),
                    PointType::infer(value),
                    field,
                )
                .await?;
            known.insert(field.clone());
        }
    }

    for (field, value) in values {
        let path = paths::info(device_key, &field);
        if update_unchanged {
            store.write_value(&path, value, true).await?;
        } else {
            store.write_value_if_changed(&path, value, true).await?;
        }
    }

    store
        .write_value(
            &paths::last_info_update(device_key),
            Value::from(chrono::Utc::now().timestamp_millis()),
            true,
        )
        .await
}

async fn apply_device_event(
    store: &dyn StateStore,
    dispatcher: &CommandDispatcher,
    device_key: &str,
    event: &str,
) -> Result<(), StoreError> {
    let path = paths::event(device_key, event);
    if !store.object_exists(&path).await? {
        tracing::debug!(device = device_key, event, "creating point for first-seen event");
        store.upsert_point(&path, PointType::Boolean, event).await?;
    }
    store.write_value(&path, Value::Bool(true), true).await?;
    dispatcher.confirm_event(device_key, event).await
}
