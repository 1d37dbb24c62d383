use crate::envelope::CommandEnvelope;
use crate::errors::{Error, Result};
use crate::metrics::COMMANDS_PUBLISHED_TOTAL;
use crate::model::Device;
use crate::mqtt::{Broker, PublishOptions};
use crate::store::DeviceStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub fn commands_topic(device_topic: &str) -> String {
    format!("{}/commands", device_topic)
}

pub fn ping_topic(device_topic: &str) -> String {
    format!("{}/ping", device_topic)
}

pub fn pong_topic(device_topic: &str) -> String {
    format!("{}/pong", device_topic)
}

pub struct CommandDispatcher {
    broker: Arc<dyn Broker>,
    devices: Arc<dyn DeviceStore>,
    ping_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        devices: Arc<dyn DeviceStore>,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            devices,
            ping_timeout,
        }
    }

    /// Publish a command to the device. Failures are logged and reported
    /// as `false`.
    pub async fn send_command(&self, device_id: &str, command: &str, data: Value) -> bool {
        match self.try_send_command(device_id, command, data).await {
            Ok(()) => true,
            Err(e) => {
                error!(device_id = %device_id, command = %command, "Failed to send command: {}", e);
                false
            }
        }
    }

    async fn try_send_command(&self, device_id: &str, command: &str, data: Value) -> Result<()> {
        let device = self.device(device_id).await?;
        let envelope = CommandEnvelope::command(command, data);
        let payload = serde_json::to_vec(&envelope)?;
        self.broker
            .publish(
                &commands_topic(&device.topic),
                payload,
                PublishOptions::at_least_once(),
            )
            .await?;
        COMMANDS_PUBLISHED_TOTAL.inc();
        info!(
            device_id = %device_id,
            command = %command,
            message_id = %envelope.message_id,
            "Command sent"
        );
        Ok(())
    }

    /// Ping the device and wait for its pong. Any failure counts as offline.
    pub async fn check_device_connectivity(&self, device_id: &str) -> bool {
        match self.ping(device_id).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(device_id = %device_id, "No pong within {:?}", self.ping_timeout);
                false
            }
            Err(e) => {
                warn!(device_id = %device_id, "Connectivity check failed: {}", e);
                false
            }
        }
    }

    async fn ping(&self, device_id: &str) -> Result<bool> {
        let device = self.device(device_id).await?;
        let payload = serde_json::to_vec(&CommandEnvelope::ping())?;
        let reply = self
            .broker
            .request(
                &ping_topic(&device.topic),
                payload,
                &pong_topic(&device.topic),
                self.ping_timeout,
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn device(&self, device_id: &str) -> Result<Device> {
        self.devices
            .find_by_id(device_id)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))
    }
}
