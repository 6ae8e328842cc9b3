//! Command dispatch and confirmation.
//!
//! Outbound command intents arrive as `(device_key, command_id, value)`
//! writes. A switch id translates to its on or off wire command; plain
//! commands go out as-is. One attempt per intent: on success the command
//! points are confirmed with acknowledged writes, on failure nothing is
//! written, which leaves the original write unacknowledged as the failure
//! signal.
//!
//! Confirmation is shared with the push-channel event path so both arrive
//! at exactly the same writes.

use crate::commands::{self, CommandKind};
use crate::paths;
use crate::registry::DeviceRegistry;
use crate::rest::{PollClient, PollError};
use kiosklink_core::{StateStore, StoreError};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    #[error("device {0:?} is disabled")]
    DeviceDisabled(String),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    client: Arc<PollClient>,
    store: Arc<dyn StateStore>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        client: Arc<PollClient>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            registry,
            client,
            store,
        }
    }

    /// Execute one command intent.
    pub async fn dispatch(
        &self,
        device_key: &str,
        command_id: &str,
        value: &Value,
    ) -> Result<(), DispatchError> {
        let device = self
            .registry
            .by_key(device_key)
            .ok_or_else(|| DispatchError::UnknownDevice(device_key.to_string()))?;
        if !device.enabled {
            return Err(DispatchError::DeviceDisabled(device_key.to_string()));
        }

        if let Some(switch) = commands::switch_by_id(command_id) {
            let requested = value.as_bool().unwrap_or(false);
            let wire_command = if requested {
                switch.command_on
            } else {
                switch.command_off
            };
            self.client
                .send_command(&device, wire_command, &Value::Bool(true))
                .await?;
            tracing::info!(
                device = device_key,
                command = command_id,
                requested,
                "switch command confirmed"
            );
            self.confirm_switch(device_key, switch, requested).await?;
            return Ok(());
        }

        let Some(command) = commands::command_by_id(command_id) else {
            return Err(DispatchError::UnknownCommand(command_id.to_string()));
        };

        match command.kind {
            CommandKind::Button => {
                // Buttons fire on true; a false write carries no intent.
                if !value.as_bool().unwrap_or(false) {
                    tracing::debug!(
                        device = device_key,
                        command = command_id,
                        "false write to button disregarded"
                    );
                    return Ok(());
                }
                self.client
                    .send_command(&device, command_id, &Value::Bool(true))
                    .await?;
                self.store
                    .write_value(&paths::command(device_key, command_id), Value::Bool(true), true)
                    .await?;
            }
            CommandKind::Text | CommandKind::Number => {
                self.client.send_command(&device, command_id, value).await?;
                self.store
                    .write_value(&paths::command(device_key, command_id), value.clone(), true)
                    .await?;
            }
        }
        tracing::info!(device = device_key, command = command_id, "command confirmed");
        Ok(())
    }

    /// Confirm command points from an inbound device event.
    ///
    /// Same writes as a successful dispatch, so observers cannot tell which
    /// channel confirmed the command.
    pub async fn confirm_event(&self, device_key: &str, event: &str) -> Result<(), StoreError> {
        if let Some((switch, on)) = commands::switch_confirmation(event) {
            self.confirm_switch(device_key, switch, on).await?;
            return Ok(());
        }

        match commands::command_by_id(event) {
            Some(command) if command.kind == CommandKind::Button => {
                self.store
                    .write_value(&paths::command(device_key, event), Value::Bool(true), true)
                    .await?;
            }
            _ => {
                tracing::trace!(
                    device = device_key,
                    event,
                    "event has no matching command, no confirmation"
                );
            }
        }
        Ok(())
    }

    async fn confirm_switch(
        &self,
        device_key: &str,
        switch: &commands::SwitchPairDescriptor,
        on: bool,
    ) -> Result<(), StoreError> {
        self.store
            .write_value(&paths::command(device_key, switch.id), Value::Bool(on), true)
            .await?;
        self.store
            .write_value(
                &paths::command(device_key, switch.command_on),
                Value::Bool(on),
                true,
            )
            .await?;
        self.store
            .write_value(
                &paths::command(device_key, switch.command_off),
                Value::Bool(!on),
                true,
            )
            .await?;
        Ok(())
    }
}
