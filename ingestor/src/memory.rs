use crate::errors::Result;
use crate::model::{
    Alert, AlertAggregates, AlertPage, AlertQuery, AlertType, Device, DeviceUpdate, NewAlert,
    NewTelemetry, Pagination, Resolution, Severity, TelemetryQuery, TelemetryRecord,
};
use crate::store::{AlertStore, DeviceStore, TelemetryStore};
use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

const TOP_DEVICES: usize = 10;

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<String, Device>,
    telemetry: Vec<TelemetryRecord>,
    alerts: Vec<Alert>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let devices = devices.into_iter().map(|d| (d.id.clone(), d)).collect();
        Self {
            inner: RwLock::new(Inner {
                devices,
                ..Default::default()
            }),
        }
    }

    pub async fn telemetry_count(&self) -> usize {
        self.inner.read().await.telemetry.len()
    }

    pub async fn alert_count(&self) -> usize {
        self.inner.read().await.alerts.len()
    }
}

/// Newest first; among equal timestamps the later insert wins.
fn newest_first<T: Clone>(items: &[T], ts: impl Fn(&T) -> chrono::DateTime<chrono::Utc>) -> Vec<T> {
    let mut sorted: Vec<T> = items.iter().rev().cloned().collect();
    sorted.sort_by(|a, b| ts(b).cmp(&ts(a)));
    sorted
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.inner.read().await.devices.get(id).cloned())
    }

    async fn find_by_topic(&self, topic: &str) -> Result<Option<Device>> {
        let inner = self.inner.read().await;
        Ok(inner.devices.values().find(|d| d.topic == topic).cloned())
    }

    async fn update(&self, id: &str, update: DeviceUpdate) -> Result<Option<Device>> {
        let mut inner = self.inner.write().await;
        Ok(inner.devices.get_mut(id).map(|device| {
            update.apply(device);
            device.clone()
        }))
    }

    async fn upsert(&self, device: Device) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.devices.entry(device.id.clone()) {
            Entry::Occupied(mut existing) => existing.get_mut().merge_seed(device),
            Entry::Vacant(slot) => {
                slot.insert(device);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn create(&self, telemetry: NewTelemetry) -> Result<TelemetryRecord> {
        let record = TelemetryRecord::from_new(telemetry);
        self.inner.write().await.telemetry.push(record.clone());
        Ok(record)
    }

    async fn query(&self, query: &TelemetryQuery) -> Result<Vec<TelemetryRecord>> {
        let inner = self.inner.read().await;
        let matching: Vec<TelemetryRecord> = inner
            .telemetry
            .iter()
            .filter(|t| query.device_id.as_deref().map_or(true, |d| t.device_id == d))
            .filter(|t| query.start.map_or(true, |s| t.timestamp >= s))
            .filter(|t| query.end.map_or(true, |e| t.timestamp <= e))
            .cloned()
            .collect();
        Ok(newest_first(&matching, |t| t.timestamp)
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn create_unique(&self, alert: NewAlert) -> Result<Option<Alert>> {
        let mut inner = self.inner.write().await;
        let parameter = alert.parameter();
        if inner
            .alerts
            .iter()
            .any(|a| a.is_open_for(&alert.device_id, alert.alert_type, parameter))
        {
            return Ok(None);
        }
        let alert = Alert::from_new(alert);
        inner.alerts.push(alert.clone());
        Ok(Some(alert))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Alert>> {
        let inner = self.inner.read().await;
        Ok(inner.alerts.iter().find(|a| a.id == id).cloned())
    }

    async fn resolve(&self, id: Uuid, resolution: Resolution) -> Result<Option<Alert>> {
        let mut inner = self.inner.write().await;
        Ok(inner.alerts.iter_mut().find(|a| a.id == id).map(|alert| {
            alert.apply_resolution(&resolution);
            alert.clone()
        }))
    }

    async fn resolve_open(
        &self,
        device_id: &str,
        alert_type: AlertType,
        parameter: Option<&str>,
        resolution: Resolution,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut resolved = 0;
        for alert in inner
            .alerts
            .iter_mut()
            .filter(|a| !a.resolved && a.device_id == device_id && a.alert_type == alert_type)
            .filter(|a| parameter.map_or(true, |p| a.parameter() == Some(p)))
        {
            alert.apply_resolution(&resolution);
            resolved += 1;
        }
        Ok(resolved)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.alerts.len();
        inner.alerts.retain(|a| a.id != id);
        Ok(inner.alerts.len() != before)
    }

    async fn query(&self, query: &AlertQuery) -> Result<AlertPage> {
        let inner = self.inner.read().await;
        let matching: Vec<Alert> = inner
            .alerts
            .iter()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        let total = matching.len() as u64;
        let alerts = newest_first(&matching, |a| a.timestamp)
            .into_iter()
            .skip(query.offset())
            .take(query.limit)
            .collect();
        Ok(AlertPage {
            alerts,
            pagination: Pagination::new(total, query.page, query.limit),
        })
    }

    async fn aggregate(&self, device_id: Option<&str>) -> Result<AlertAggregates> {
        let inner = self.inner.read().await;
        let scoped: Vec<&Alert> = inner
            .alerts
            .iter()
            .filter(|a| device_id.map_or(true, |d| a.device_id == d))
            .collect();

        let mut by_type: HashMap<AlertType, u64> = HashMap::new();
        let mut by_device: HashMap<&str, u64> = HashMap::new();
        let mut unresolved = 0;
        let mut critical = 0;
        for alert in scoped.iter().filter(|a| !a.resolved) {
            unresolved += 1;
            if alert.severity == Severity::Critical {
                critical += 1;
            }
            *by_type.entry(alert.alert_type).or_default() += 1;
            *by_device.entry(alert.device_id.as_str()).or_default() += 1;
        }

        let mut by_type: Vec<(AlertType, u64)> = by_type.into_iter().collect();
        by_type.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));

        let mut by_device: Vec<(String, u64)> = by_device
            .into_iter()
            .map(|(id, count)| (id.to_string(), count))
            .collect();
        by_device.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        by_device.truncate(TOP_DEVICES);

        Ok(AlertAggregates {
            total: scoped.len() as u64,
            unresolved,
            critical,
            by_type,
            by_device,
        })
    }
}
