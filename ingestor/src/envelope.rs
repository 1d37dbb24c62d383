use crate::errors::{Error, Result};
use crate::model::{Battery, Location};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    #[serde(default)]
    pub data: BTreeMap<String, f64>,
    pub battery: Option<Battery>,
    pub signal_strength: Option<f64>,
    pub location: Option<Location>,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: Option<DateTime<Utc>>,
    /// Keys of `data` entries that were not numbers.
    #[serde(skip)]
    pub ignored_readings: Vec<String>,
}

impl TelemetryMessage {
    fn from_value(mut value: Value) -> Result<Self> {
        let mut ignored = Vec::new();
        if let Some(Value::Object(data)) = value.get_mut("data") {
            data.retain(|key, reading| {
                if reading.is_number() {
                    return true;
                }
                ignored.push(key.clone());
                false
            });
        }
        let mut msg: TelemetryMessage = serde_json::from_value(value)?;
        msg.ignored_readings = ignored;
        Ok(msg)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub status: String,
    pub data: Option<Value>,
    pub battery: Option<Battery>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertMessage {
    pub alert_type: Option<String>,
    pub severity: Option<String>,
    pub message: Option<String>,
    pub data: Option<Value>,
    pub status: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponseMessage {
    pub command: String,
    pub status: String,
    pub data: Option<Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Inbound message classified by its declared `type`.
#[derive(Debug, Clone)]
pub enum Inbound {
    Telemetry(TelemetryMessage),
    CommandResponse(CommandResponseMessage),
    Status(StatusMessage),
    Alert(AlertMessage),
    Unknown(String),
}

impl Inbound {
    /// Parse a raw payload. Invalid JSON, a missing `type`, or a body that
    /// does not fit its declared type are errors; an unrecognized `type` is not.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("Message has no type".to_string()))?
            .to_string();

        let inbound = match kind.as_str() {
            "telemetry" => Inbound::Telemetry(TelemetryMessage::from_value(value)?),
            "command_response" => Inbound::CommandResponse(serde_json::from_value(value)?),
            "status" => Inbound::Status(serde_json::from_value(value)?),
            "alert" => Inbound::Alert(serde_json::from_value(value)?),
            _ => Inbound::Unknown(kind),
        };
        Ok(inbound)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Inbound::Telemetry(_) => MessageKind::Telemetry,
            Inbound::CommandResponse(_) => MessageKind::CommandResponse,
            Inbound::Status(_) => MessageKind::Status,
            Inbound::Alert(_) => MessageKind::Alert,
            Inbound::Unknown(_) => MessageKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Telemetry,
    CommandResponse,
    Status,
    Alert,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Telemetry => "telemetry",
            MessageKind::CommandResponse => "command_response",
            MessageKind::Status => "status",
            MessageKind::Alert => "alert",
            MessageKind::Unknown => "unknown",
        }
    }
}

/// Outbound envelope published to a device's control topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
}

impl CommandEnvelope {
    pub fn command(command: impl Into<String>, data: Value) -> Self {
        Self {
            kind: "command".to_string(),
            command: Some(command.into()),
            data,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: "ping".to_string(),
            command: None,
            data: Value::Object(Default::default()),
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_telemetry() {
        let payload = json!({
            "type": "telemetry",
            "data": {"moisture": 15.0, "temperature": 21.5},
            "battery": {"level": 80, "charging": false},
            "signalStrength": -61,
            "location": {"longitude": 13.4, "latitude": 52.5}
        });
        let inbound = Inbound::parse(payload.to_string().as_bytes()).unwrap();
        match inbound {
            Inbound::Telemetry(t) => {
                assert_eq!(t.data.get("moisture"), Some(&15.0));
                assert_eq!(t.battery.map(|b| b.level), Some(80.0));
                assert_eq!(t.signal_strength, Some(-61.0));
                assert_eq!(t.location.map(|l| l.latitude), Some(52.5));
                assert!(t.timestamp.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_telemetry_keeps_numeric_readings() {
        let payload = br#"{"type":"telemetry","data":{"moisture":10,"status":"ok","probe":null}}"#;
        match Inbound::parse(payload).unwrap() {
            Inbound::Telemetry(t) => {
                assert_eq!(t.data.len(), 1);
                assert_eq!(t.data.get("moisture"), Some(&10.0));
                assert_eq!(t.ignored_readings.len(), 2);
                assert!(t.ignored_readings.contains(&"status".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type_is_not_an_error() {
        let inbound = Inbound::parse(br#"{"type": "bogus", "x": 1}"#).unwrap();
        assert_eq!(inbound.kind(), MessageKind::Unknown);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Inbound::parse(b"not json").is_err());
        assert!(Inbound::parse(br#"{"data": {}}"#).is_err());
        // status requires a status field
        assert!(Inbound::parse(br#"{"type": "status"}"#).is_err());
    }

    #[test]
    fn test_parse_alert_defaults_are_optional() {
        let inbound = Inbound::parse(br#"{"type": "alert"}"#).unwrap();
        match inbound {
            Inbound::Alert(a) => {
                assert!(a.alert_type.is_none());
                assert!(a.severity.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_command_envelope_wire_shape() {
        let envelope = CommandEnvelope::command("reboot", json!({"delay": 5}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["command"], "reboot");
        assert_eq!(value["data"]["delay"], 5);
        assert!(value["messageId"].is_string());
        assert!(value["timestamp"].is_string());

        let ping = serde_json::to_value(CommandEnvelope::ping()).unwrap();
        assert_eq!(ping["type"], "ping");
        assert!(ping.get("command").is_none());
    }
}
