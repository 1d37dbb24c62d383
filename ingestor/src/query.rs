use crate::errors::{Error, Result};
use crate::metrics::ALERTS_RESOLVED_TOTAL;
use crate::model::{
    Alert, AlertPage, AlertQuery, AlertSummary, DeviceAlertCount, Resolution, TypeCount,
};
use crate::store::{AlertStore, DeviceStore};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";
const UNKNOWN_DEVICE_TYPE: &str = "unknown";

pub struct AlertService {
    alerts: Arc<dyn AlertStore>,
    devices: Arc<dyn DeviceStore>,
}

impl AlertService {
    pub fn new(alerts: Arc<dyn AlertStore>, devices: Arc<dyn DeviceStore>) -> Self {
        Self { alerts, devices }
    }

    /// One page of alerts, newest first. A zero limit falls back to the
    /// default; larger limits are capped.
    pub async fn get_alerts(&self, mut query: AlertQuery) -> Result<AlertPage> {
        query.limit = match query.limit {
            0 => DEFAULT_LIMIT,
            n => n.min(MAX_LIMIT),
        };
        query.page = query.page.max(1);
        self.alerts.query(&query).await
    }

    pub async fn get_alerts_summary(&self, device_id: Option<&str>) -> Result<AlertSummary> {
        let aggregates = self.alerts.aggregate(device_id).await?;

        let by_type = aggregates
            .by_type
            .into_iter()
            .map(|(alert_type, count)| TypeCount { alert_type, count })
            .collect();

        let mut top_devices = Vec::with_capacity(aggregates.by_device.len());
        for (device_id, count) in aggregates.by_device {
            let device = self.devices.find_by_id(&device_id).await?;
            let (device_name, device_type) = match device {
                Some(d) => (d.name, d.device_type),
                None => (
                    UNKNOWN_DEVICE_NAME.to_string(),
                    UNKNOWN_DEVICE_TYPE.to_string(),
                ),
            };
            top_devices.push(DeviceAlertCount {
                device_id,
                device_name,
                device_type,
                count,
            });
        }

        Ok(AlertSummary {
            total: aggregates.total,
            unresolved: aggregates.unresolved,
            critical: aggregates.critical,
            by_type,
            top_devices,
        })
    }

    pub async fn get_alert(&self, id: Uuid) -> Result<Alert> {
        self.alerts
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::AlertNotFound(id.to_string()))
    }

    pub async fn resolve_alert(
        &self,
        id: Uuid,
        user_id: &str,
        notes: Option<String>,
    ) -> Result<Alert> {
        let alert = self
            .alerts
            .resolve(id, Resolution::new(user_id, notes))
            .await?
            .ok_or_else(|| Error::AlertNotFound(id.to_string()))?;
        ALERTS_RESOLVED_TOTAL.with_label_values(&["user"]).inc();
        info!(alert_id = %id, resolved_by = %user_id, "Alert resolved");
        Ok(alert)
    }

    pub async fn delete_alert(&self, id: Uuid) -> Result<()> {
        if !self.alerts.delete(id).await? {
            return Err(Error::AlertNotFound(id.to_string()));
        }
        info!(alert_id = %id, "Alert deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::{
        AlertType, Device, DeviceStatus, Firmware, NewAlert, ResolvedFilter, Severity,
    };
    use serde_json::json;

    fn device(id: &str, name: &str) -> Device {
        Device {
            id: id.to_string(),
            name: name.to_string(),
            device_type: "soil_sensor".to_string(),
            topic: format!("iot/devices/{}", id),
            status: DeviceStatus::Active,
            last_communication: None,
            battery: None,
            firmware: Firmware::default(),
        }
    }

    async fn alert(
        store: &MemoryStore,
        device_id: &str,
        alert_type: AlertType,
        severity: Severity,
        parameter: &str,
    ) -> Alert {
        store
            .create_unique(NewAlert {
                device_id: device_id.to_string(),
                alert_type,
                severity,
                message: format!("{} on {}", alert_type, device_id),
                telemetry_data: json!({ "parameter": parameter }),
            })
            .await
            .unwrap()
            .unwrap()
    }

    fn service(store: &Arc<MemoryStore>) -> AlertService {
        AlertService::new(store.clone(), store.clone())
    }

    #[tokio::test]
    async fn test_limit_defaults_and_caps() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);

        let page = service.get_alerts(AlertQuery::default()).await.unwrap();
        assert_eq!(page.pagination.limit, DEFAULT_LIMIT);
        assert_eq!(page.pagination.page, 1);
        assert_eq!(page.pagination.total, 0);
        assert!(page.alerts.is_empty());

        let page = service
            .get_alerts(AlertQuery {
                limit: 50_000,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.pagination.limit, MAX_LIMIT);
    }

    #[tokio::test]
    async fn test_pagination_metadata() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            alert(&store, "a", AlertType::Other, Severity::Info, &format!("p{}", i)).await;
        }
        let page = service(&store)
            .get_alerts(AlertQuery {
                limit: 2,
                page: 3,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.alerts.len(), 1);
        assert_eq!(page.pagination.total, 5);
        assert_eq!(page.pagination.pages, 3);
    }

    #[tokio::test]
    async fn test_summary_counts_and_ordering() {
        let store = Arc::new(MemoryStore::with_devices(vec![device("a", "Field A")]));
        alert(&store, "a", AlertType::LowBattery, Severity::Critical, "x").await;
        alert(&store, "a", AlertType::LowBattery, Severity::Warning, "y").await;
        alert(&store, "a", AlertType::Offline, Severity::Warning, "").await;
        alert(&store, "b", AlertType::Offline, Severity::Critical, "z").await;

        let summary = service(&store).get_alerts_summary(None).await.unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.unresolved, 4);
        assert_eq!(summary.critical, 2);

        let by_type: Vec<(AlertType, u64)> = summary
            .by_type
            .iter()
            .map(|t| (t.alert_type, t.count))
            .collect();
        assert_eq!(
            by_type,
            vec![(AlertType::LowBattery, 2), (AlertType::Offline, 2)]
        );

        assert_eq!(summary.top_devices[0].device_id, "a");
        assert_eq!(summary.top_devices[0].device_name, "Field A");
        assert_eq!(summary.top_devices[0].count, 3);
        assert_eq!(summary.top_devices[1].device_name, UNKNOWN_DEVICE_NAME);
        assert_eq!(summary.top_devices[1].device_type, UNKNOWN_DEVICE_TYPE);
    }

    #[tokio::test]
    async fn test_resolve_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        let created = alert(&store, "a", AlertType::Offline, Severity::Warning, "").await;

        let resolved = service
            .resolve_alert(created.id, "operator-7", Some("rebooted".to_string()))
            .await
            .unwrap();
        assert!(resolved.resolved);
        assert!(resolved.resolved_at.is_some());
        assert_eq!(resolved.resolved_by.as_deref(), Some("operator-7"));
        assert_eq!(resolved.resolution_notes.as_deref(), Some("rebooted"));

        let open = service
            .get_alerts(AlertQuery {
                resolved: ResolvedFilter::False,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(open.alerts.is_empty());
    }

    #[tokio::test]
    async fn test_missing_alert_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        let id = Uuid::new_v4();

        assert!(matches!(
            service.resolve_alert(id, "u", None).await,
            Err(Error::AlertNotFound(_))
        ));
        assert!(matches!(
            service.delete_alert(id).await,
            Err(Error::AlertNotFound(_))
        ));
        assert!(matches!(
            service.get_alert(id).await,
            Err(Error::AlertNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_alert() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        let created = alert(&store, "a", AlertType::Other, Severity::Info, "").await;

        service.delete_alert(created.id).await.unwrap();
        assert_eq!(store.alert_count().await, 0);
    }
}
