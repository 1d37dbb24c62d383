use crate::errors::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Maintenance,
    Offline,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Inactive => "inactive",
            DeviceStatus::Maintenance => "maintenance",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
        }
    }
}

impl FromStr for DeviceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DeviceStatus::Active),
            "inactive" => Ok(DeviceStatus::Inactive),
            "maintenance" => Ok(DeviceStatus::Maintenance),
            "offline" => Ok(DeviceStatus::Offline),
            "error" => Ok(DeviceStatus::Error),
            other => Err(Error::Validation(format!("Unknown device status: {}", other))),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Battery {
    pub level: f64,
    #[serde(default)]
    pub charging: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Firmware {
    pub version: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Device record. Owned by the device service; this crate only reads it and
/// mutates its operational fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub device_type: String,
    pub topic: String,
    pub status: DeviceStatus,
    pub last_communication: Option<DateTime<Utc>>,
    pub battery: Option<Battery>,
    #[serde(default)]
    pub firmware: Firmware,
}

impl Device {
    /// Re-register an existing device. Registry fields come from `seed`;
    /// its operational fields only fill values the device does not have yet.
    pub fn merge_seed(&mut self, seed: Device) {
        self.name = seed.name;
        self.device_type = seed.device_type;
        self.topic = seed.topic;
        if self.battery.is_none() {
            self.battery = seed.battery;
        }
        if self.firmware.version.is_none() {
            self.firmware.version = seed.firmware.version;
        }
    }
}

/// Partial update of a device's operational fields. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub status: Option<DeviceStatus>,
    pub last_communication: Option<DateTime<Utc>>,
    pub battery: Option<Battery>,
    pub firmware_version: Option<String>,
    pub firmware_last_updated: Option<DateTime<Utc>>,
}

impl DeviceUpdate {
    pub fn apply(&self, device: &mut Device) {
        if let Some(status) = self.status {
            device.status = status;
        }
        if let Some(ts) = self.last_communication {
            device.last_communication = Some(ts);
        }
        if let Some(battery) = self.battery {
            device.battery = Some(battery);
        }
        if let Some(version) = &self.firmware_version {
            device.firmware.version = Some(version.clone());
        }
        if let Some(ts) = self.firmware_last_updated {
            device.firmware.last_updated = Some(ts);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTelemetry {
    pub device_id: String,
    pub readings: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
    pub battery: Option<Battery>,
    pub signal_strength: Option<f64>,
    pub location: Option<Location>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub id: Uuid,
    pub device_id: String,
    pub readings: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
    pub battery: Option<Battery>,
    pub signal_strength: Option<f64>,
    pub location: Option<Location>,
    pub metadata: serde_json::Value,
}

impl TelemetryRecord {
    pub fn from_new(new: NewTelemetry) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: new.device_id,
            readings: new.readings,
            timestamp: new.timestamp,
            battery: new.battery,
            signal_strength: new.signal_strength,
            location: new.location,
            metadata: new.metadata,
        }
    }

    pub fn reading(&self, parameter: &str) -> Option<f64> {
        self.readings.get(parameter).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LowBattery,
    Offline,
    ThresholdExceeded,
    ThresholdBelow,
    MaintenanceRequired,
    TamperDetected,
    ConnectivityIssue,
    SystemError,
    Other,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::LowBattery => "low_battery",
            AlertType::Offline => "offline",
            AlertType::ThresholdExceeded => "threshold_exceeded",
            AlertType::ThresholdBelow => "threshold_below",
            AlertType::MaintenanceRequired => "maintenance_required",
            AlertType::TamperDetected => "tamper_detected",
            AlertType::ConnectivityIssue => "connectivity_issue",
            AlertType::SystemError => "system_error",
            AlertType::Other => "other",
        }
    }
}

impl FromStr for AlertType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low_battery" => Ok(AlertType::LowBattery),
            "offline" => Ok(AlertType::Offline),
            "threshold_exceeded" => Ok(AlertType::ThresholdExceeded),
            "threshold_below" => Ok(AlertType::ThresholdBelow),
            "maintenance_required" => Ok(AlertType::MaintenanceRequired),
            "tamper_detected" => Ok(AlertType::TamperDetected),
            "connectivity_issue" => Ok(AlertType::ConnectivityIssue),
            "system_error" => Ok(AlertType::SystemError),
            "other" => Ok(AlertType::Other),
            other => Err(Error::Validation(format!("Unknown alert type: {}", other))),
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(Error::Validation(format!("Unknown severity: {}", other))),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert to be inserted, subject to duplicate suppression.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub device_id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub telemetry_data: serde_json::Value,
}

impl NewAlert {
    /// The `parameter` discriminator carried in the telemetry snapshot.
    pub fn parameter(&self) -> Option<&str> {
        self.telemetry_data.get("parameter").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub device_id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub telemetry_data: serde_json::Value,
    pub notification_sent: bool,
    pub notification_timestamp: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn from_new(new: NewAlert) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: new.device_id,
            alert_type: new.alert_type,
            severity: new.severity,
            message: new.message,
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            telemetry_data: new.telemetry_data,
            notification_sent: false,
            notification_timestamp: None,
        }
    }

    pub fn parameter(&self) -> Option<&str> {
        self.telemetry_data.get("parameter").and_then(|v| v.as_str())
    }

    /// Whether this alert occupies the open slot for the given key.
    pub fn is_open_for(&self, device_id: &str, alert_type: AlertType, parameter: Option<&str>) -> bool {
        !self.resolved
            && self.device_id == device_id
            && self.alert_type == alert_type
            && self.parameter().unwrap_or("") == parameter.unwrap_or("")
    }

    pub fn apply_resolution(&mut self, resolution: &Resolution) {
        self.resolved = true;
        self.resolved_at = Some(resolution.at);
        self.resolved_by = Some(resolution.by.clone());
        self.resolution_notes = resolution.notes.clone();
    }
}

/// Identity used for alerts closed by the auto-resolution engine.
pub const SYSTEM_RESOLVER: &str = "system";

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub by: String,
    pub notes: Option<String>,
    pub at: DateTime<Utc>,
}

impl Resolution {
    pub fn new(by: impl Into<String>, notes: Option<String>) -> Self {
        Self {
            by: by.into(),
            notes,
            at: Utc::now(),
        }
    }

    pub fn system(notes: impl Into<String>) -> Self {
        Self::new(SYSTEM_RESOLVER, Some(notes.into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedFilter {
    #[default]
    All,
    True,
    False,
}

impl ResolvedFilter {
    pub fn matches(&self, resolved: bool) -> bool {
        match self {
            ResolvedFilter::All => true,
            ResolvedFilter::True => resolved,
            ResolvedFilter::False => !resolved,
        }
    }
}

impl FromStr for ResolvedFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(ResolvedFilter::All),
            "true" => Ok(ResolvedFilter::True),
            "false" => Ok(ResolvedFilter::False),
            other => Err(Error::Validation(format!("Invalid resolved filter: {}", other))),
        }
    }
}

/// Filters for listing alerts. All provided criteria are ANDed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertQuery {
    pub device_id: Option<String>,
    pub resolved: ResolvedFilter,
    pub severity: Option<Severity>,
    pub alert_type: Option<AlertType>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
    pub page: usize,
}

impl AlertQuery {
    pub fn matches(&self, alert: &Alert) -> bool {
        self.device_id.as_deref().map_or(true, |d| alert.device_id == d)
            && self.resolved.matches(alert.resolved)
            && self.severity.map_or(true, |s| alert.severity == s)
            && self.alert_type.map_or(true, |t| alert.alert_type == t)
            && self.start.map_or(true, |s| alert.timestamp >= s)
            && self.end.map_or(true, |e| alert.timestamp <= e)
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.limit
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pagination {
    pub total: u64,
    pub page: usize,
    pub limit: usize,
    pub pages: u64,
}

impl Pagination {
    pub fn new(total: u64, page: usize, limit: usize) -> Self {
        let pages = if limit == 0 {
            0
        } else {
            total.div_ceil(limit as u64)
        };
        Self {
            total,
            page,
            limit,
            pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertPage {
    pub alerts: Vec<Alert>,
    pub pagination: Pagination,
}

/// Raw counts produced by an alert store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertAggregates {
    pub total: u64,
    pub unresolved: u64,
    pub critical: u64,
    /// Unresolved counts per type, highest first.
    pub by_type: Vec<(AlertType, u64)>,
    /// Unresolved counts per device, highest first, at most ten.
    pub by_device: Vec<(String, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeCount {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceAlertCount {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertSummary {
    pub total: u64,
    pub unresolved: u64,
    pub critical: u64,
    pub by_type: Vec<TypeCount>,
    pub top_devices: Vec<DeviceAlertCount>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryQuery {
    pub device_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct TelemetryResponse {
    pub data: Vec<TelemetryRecord>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}
