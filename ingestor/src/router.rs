use crate::engine::AlertEngine;
use crate::envelope::{
    AlertMessage, CommandResponseMessage, Inbound, MessageKind, StatusMessage, TelemetryMessage,
};
use crate::errors::Result;
use crate::metrics::{
    HANDLE_LATENCY_SECONDS, MESSAGES_DROPPED_TOTAL, MESSAGES_FAILED_TOTAL,
    MESSAGES_PROCESSED_TOTAL, TELEMETRY_RECORDED_TOTAL,
};
use crate::model::{
    AlertType, Device, DeviceStatus, DeviceUpdate, NewAlert, NewTelemetry, Severity,
};
use crate::mqtt::InboundMessage;
use crate::resolution::AutoResolver;
use crate::rules::RuleRegistry;
use crate::store::{AlertStore, DeviceStore, TelemetryStore};
use crate::validate::{validate, validate_battery};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Suffixes of the topics we publish to ourselves, or that carry replies.
const CONTROL_SUFFIXES: [&str; 3] = ["/commands", "/ping", "/pong"];

const FIRMWARE_UPDATE: &str = "firmware_update";
const SUCCESS: &str = "success";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    ForeignTopic,
    ControlTopic,
    Malformed,
    Invalid,
    UnknownDevice,
    UnknownType,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::ForeignTopic => "foreign_topic",
            IgnoreReason::ControlTopic => "control_topic",
            IgnoreReason::Malformed => "malformed",
            IgnoreReason::Invalid => "invalid",
            IgnoreReason::UnknownDevice => "unknown_device",
            IgnoreReason::UnknownType => "unknown_type",
        }
    }
}

/// What became of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Processed(MessageKind),
    Ignored(IgnoreReason),
}

pub struct MessageRouter {
    topic_prefix: String,
    devices: Arc<dyn DeviceStore>,
    telemetry: Arc<dyn TelemetryStore>,
    engine: AlertEngine,
    resolver: AutoResolver,
}

impl MessageRouter {
    pub fn new(
        topic_prefix: impl Into<String>,
        devices: Arc<dyn DeviceStore>,
        telemetry: Arc<dyn TelemetryStore>,
        alerts: Arc<dyn AlertStore>,
        rules: Arc<RuleRegistry>,
    ) -> Self {
        Self {
            topic_prefix: topic_prefix.into().trim_end_matches('/').to_string(),
            engine: AlertEngine::new(devices.clone(), alerts.clone(), rules.clone()),
            resolver: AutoResolver::new(devices.clone(), alerts, rules),
            devices,
            telemetry,
        }
    }

    /// Handle one message, recording the outcome. Never fails.
    pub async fn process(&self, message: InboundMessage) {
        let start = Instant::now();
        match self.handle_message(&message.topic, &message.payload).await {
            Ok(Disposition::Processed(kind)) => {
                MESSAGES_PROCESSED_TOTAL
                    .with_label_values(&[kind.as_str()])
                    .inc();
            }
            Ok(Disposition::Ignored(reason)) => {
                MESSAGES_DROPPED_TOTAL
                    .with_label_values(&[reason.as_str()])
                    .inc();
            }
            Err(e) => {
                MESSAGES_FAILED_TOTAL.inc();
                error!(topic = %message.topic, "Failed to handle message: {}", e);
            }
        }
        HANDLE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
    }

    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<Disposition> {
        if !self.owns_topic(topic) {
            return Ok(Disposition::Ignored(IgnoreReason::ForeignTopic));
        }
        if CONTROL_SUFFIXES.iter().any(|s| topic.ends_with(s)) {
            debug!(topic = %topic, "Ignoring control topic");
            return Ok(Disposition::Ignored(IgnoreReason::ControlTopic));
        }

        let inbound = match Inbound::parse(payload) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(topic = %topic, "Dropping malformed message: {}", e);
                return Ok(Disposition::Ignored(IgnoreReason::Malformed));
            }
        };

        let Some(device) = self.devices.find_by_topic(topic).await? else {
            warn!(topic = %topic, "No device registered for topic");
            return Ok(Disposition::Ignored(IgnoreReason::UnknownDevice));
        };

        let kind = inbound.kind();
        let disposition = match inbound {
            Inbound::Telemetry(msg) => self.handle_telemetry(&device, msg).await?,
            Inbound::CommandResponse(msg) => self.handle_command_response(&device, msg).await?,
            Inbound::Status(msg) => self.handle_status(&device, msg).await?,
            Inbound::Alert(msg) => self.handle_alert(&device, msg).await?,
            Inbound::Unknown(kind) => {
                warn!(topic = %topic, device_id = %device.id, "Unknown message type: {}", kind);
                return Ok(Disposition::Ignored(IgnoreReason::UnknownType));
            }
        };
        debug!(topic = %topic, device_id = %device.id, kind = kind.as_str(), "Message handled");
        Ok(disposition)
    }

    fn owns_topic(&self, topic: &str) -> bool {
        topic
            .strip_prefix(self.topic_prefix.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    async fn handle_telemetry(&self, device: &Device, msg: TelemetryMessage) -> Result<Disposition> {
        if let Err(e) = validate(&msg) {
            warn!(device_id = %device.id, "Dropping invalid telemetry: {}", e);
            return Ok(Disposition::Ignored(IgnoreReason::Invalid));
        }
        if !msg.ignored_readings.is_empty() {
            warn!(
                device_id = %device.id,
                "Ignoring non-numeric readings: {}",
                msg.ignored_readings.join(", ")
            );
        }

        let battery = msg.battery;
        let record = self
            .telemetry
            .create(NewTelemetry {
                device_id: device.id.clone(),
                readings: msg.data,
                timestamp: msg.timestamp.unwrap_or_else(Utc::now),
                battery,
                signal_strength: msg.signal_strength,
                location: msg.location,
                metadata: msg.metadata,
            })
            .await?;
        TELEMETRY_RECORDED_TOTAL.inc();

        self.engine.evaluate(&record).await?;
        self.resolver.auto_resolve(&record).await?;

        self.devices
            .update(
                &device.id,
                DeviceUpdate {
                    status: Some(DeviceStatus::Active),
                    last_communication: Some(Utc::now()),
                    battery,
                    ..Default::default()
                },
            )
            .await?;

        Ok(Disposition::Processed(MessageKind::Telemetry))
    }

    async fn handle_command_response(
        &self,
        device: &Device,
        msg: CommandResponseMessage,
    ) -> Result<Disposition> {
        info!(
            device_id = %device.id,
            command = %msg.command,
            status = %msg.status,
            "Command response received"
        );
        if msg.command != FIRMWARE_UPDATE || msg.status != SUCCESS {
            return Ok(Disposition::Processed(MessageKind::CommandResponse));
        }

        let version = msg
            .data
            .as_ref()
            .and_then(|d| d.get("version"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if version.is_none() {
            warn!(device_id = %device.id, "Firmware update reported without a version");
        }
        self.devices
            .update(
                &device.id,
                DeviceUpdate {
                    firmware_version: version,
                    firmware_last_updated: Some(msg.timestamp.unwrap_or_else(Utc::now)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(Disposition::Processed(MessageKind::CommandResponse))
    }

    async fn handle_status(&self, device: &Device, msg: StatusMessage) -> Result<Disposition> {
        let status: DeviceStatus = match msg.status.parse() {
            Ok(status) => status,
            Err(e) => {
                warn!(device_id = %device.id, "Dropping status message: {}", e);
                return Ok(Disposition::Ignored(IgnoreReason::Invalid));
            }
        };
        if let Some(Err(e)) = msg.battery.as_ref().map(validate_battery) {
            warn!(device_id = %device.id, "Dropping status message: {}", e);
            return Ok(Disposition::Ignored(IgnoreReason::Invalid));
        }

        self.devices
            .update(
                &device.id,
                DeviceUpdate {
                    status: Some(status),
                    last_communication: Some(Utc::now()),
                    battery: msg.battery,
                    ..Default::default()
                },
            )
            .await?;

        let alert_type = match status {
            DeviceStatus::Offline => Some(AlertType::Offline),
            DeviceStatus::Error => Some(AlertType::SystemError),
            _ => None,
        };
        if let Some(alert_type) = alert_type {
            self.engine
                .raise(NewAlert {
                    device_id: device.id.clone(),
                    alert_type,
                    severity: Severity::Warning,
                    message: format!("Device {} reported status {}", device.name, status),
                    telemetry_data: msg.data.unwrap_or_else(|| json!({})),
                })
                .await?;
        }

        Ok(Disposition::Processed(MessageKind::Status))
    }

    async fn handle_alert(&self, device: &Device, msg: AlertMessage) -> Result<Disposition> {
        let alert_type = msg
            .alert_type
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(AlertType::Other);
        let severity = msg
            .severity
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Severity::Warning);
        let message = msg
            .message
            .unwrap_or_else(|| format!("Alert reported by {}", device.name));

        self.engine
            .raise(NewAlert {
                device_id: device.id.clone(),
                alert_type,
                severity,
                message,
                telemetry_data: msg.data.unwrap_or_else(|| json!({})),
            })
            .await?;

        if let Some(status) = msg.status {
            match status.parse::<DeviceStatus>() {
                Ok(status) => {
                    self.devices
                        .update(
                            &device.id,
                            DeviceUpdate {
                                status: Some(status),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                Err(e) => warn!(device_id = %device.id, "Ignoring alert status: {}", e),
            }
        }

        Ok(Disposition::Processed(MessageKind::Alert))
    }
}

/// Drain the inbound channel, one message at a time, until it closes.
pub async fn run_router(mut rx: mpsc::Receiver<InboundMessage>, router: Arc<MessageRouter>) {
    info!("Starting message router");
    while let Some(message) = rx.recv().await {
        router.process(message).await;
    }
    info!("Inbound channel closed, router stopped");
}
