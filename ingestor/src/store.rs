use crate::errors::Result;
use crate::model::{
    Alert, AlertAggregates, AlertPage, AlertQuery, AlertType, Device, DeviceUpdate, NewAlert,
    NewTelemetry, Resolution, TelemetryQuery, TelemetryRecord,
};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>>;

    async fn find_by_topic(&self, topic: &str) -> Result<Option<Device>>;

    /// Apply a partial update. Returns the updated device, or `None` if the
    /// id does not resolve.
    async fn update(&self, id: &str, update: DeviceUpdate) -> Result<Option<Device>>;

    /// Register a device. An existing record keeps its status, battery and
    /// firmware; see [`Device::merge_seed`].
    async fn upsert(&self, device: Device) -> Result<()>;
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn create(&self, telemetry: NewTelemetry) -> Result<TelemetryRecord>;

    async fn query(&self, query: &TelemetryQuery) -> Result<Vec<TelemetryRecord>>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Insert the alert unless an unresolved alert with the same
    /// (device, type, parameter) key exists. The check and the insert are a
    /// single atomic step. Returns `None` when the alert was suppressed.
    async fn create_unique(&self, alert: NewAlert) -> Result<Option<Alert>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Alert>>;

    /// Mark one alert resolved. Returns `None` if the id does not exist.
    async fn resolve(&self, id: Uuid, resolution: Resolution) -> Result<Option<Alert>>;

    /// Resolve every unresolved alert for the device and type. `parameter:
    /// None` matches any parameter. Returns the number of alerts closed.
    async fn resolve_open(
        &self,
        device_id: &str,
        alert_type: AlertType,
        parameter: Option<&str>,
        resolution: Resolution,
    ) -> Result<u64>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn query(&self, query: &AlertQuery) -> Result<AlertPage>;

    async fn aggregate(&self, device_id: Option<&str>) -> Result<AlertAggregates>;
}

/// Handles to the three stores, as passed to the pipeline components.
#[derive(Clone)]
pub struct Stores {
    pub devices: Arc<dyn DeviceStore>,
    pub telemetry: Arc<dyn TelemetryStore>,
    pub alerts: Arc<dyn AlertStore>,
}

impl Stores {
    /// All three seams backed by one store.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: DeviceStore + TelemetryStore + AlertStore + 'static,
    {
        Self {
            devices: store.clone(),
            telemetry: store.clone(),
            alerts: store,
        }
    }
}
