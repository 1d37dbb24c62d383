use iot_alerting::envelope::MessageKind;
use iot_alerting::memory::MemoryStore;
use iot_alerting::model::{
    AlertQuery, AlertType, Device, DeviceStatus, Firmware, NewAlert, ResolvedFilter, Severity,
    SYSTEM_RESOLVER,
};
use iot_alerting::query::AlertService;
use iot_alerting::router::{Disposition, IgnoreReason, MessageRouter};
use iot_alerting::rules::RuleRegistry;
use iot_alerting::store::{AlertStore, DeviceStore, Stores};
use serde_json::json;
use std::sync::Arc;

const PREFIX: &str = "iot/devices";

fn device(id: &str, device_type: &str) -> Device {
    Device {
        id: id.to_string(),
        name: format!("Device {}", id),
        device_type: device_type.to_string(),
        topic: topic(id),
        status: DeviceStatus::Inactive,
        last_communication: None,
        battery: None,
        firmware: Firmware::default(),
    }
}

fn topic(id: &str) -> String {
    format!("{}/{}", PREFIX, id)
}

struct Pipeline {
    store: Arc<MemoryStore>,
    router: MessageRouter,
    service: AlertService,
}

fn pipeline(devices: Vec<Device>) -> Pipeline {
    let store = Arc::new(MemoryStore::with_devices(devices));
    let stores = Stores::from_shared(store.clone());
    let router = MessageRouter::new(
        PREFIX,
        stores.devices.clone(),
        stores.telemetry.clone(),
        stores.alerts.clone(),
        Arc::new(RuleRegistry::default()),
    );
    let service = AlertService::new(stores.alerts, stores.devices);
    Pipeline {
        store,
        router,
        service,
    }
}

impl Pipeline {
    async fn send(&self, device_id: &str, payload: serde_json::Value) -> Disposition {
        self.router
            .handle_message(&topic(device_id), payload.to_string().as_bytes())
            .await
            .unwrap()
    }

    async fn telemetry(&self, device_id: &str, data: serde_json::Value) -> Disposition {
        self.send(device_id, json!({ "type": "telemetry", "data": data }))
            .await
    }

    async fn battery(&self, device_id: &str, level: f64) -> Disposition {
        self.send(
            device_id,
            json!({
                "type": "telemetry",
                "data": {},
                "battery": { "level": level, "charging": false }
            }),
        )
        .await
    }

    async fn device(&self, id: &str) -> Device {
        DeviceStore::find_by_id(self.store.as_ref(), id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn alerts(&self, resolved: ResolvedFilter) -> Vec<iot_alerting::model::Alert> {
        self.service
            .get_alerts(AlertQuery {
                resolved,
                ..Default::default()
            })
            .await
            .unwrap()
            .alerts
    }
}

#[tokio::test]
async fn test_repeated_low_battery_creates_one_alert() {
    let p = pipeline(vec![device("cam-1", "camera")]);

    p.battery("cam-1", 15.0).await;
    p.battery("cam-1", 12.0).await;
    p.battery("cam-1", 8.0).await;

    let alerts = p.alerts(ResolvedFilter::All).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::LowBattery);
    assert_eq!(p.store.telemetry_count().await, 3);
}

#[tokio::test]
async fn test_battery_severity_thresholds() {
    let p = pipeline(vec![
        device("b9", "camera"),
        device("b15", "camera"),
        device("b25", "camera"),
    ]);

    p.battery("b9", 9.0).await;
    p.battery("b15", 15.0).await;
    p.battery("b25", 25.0).await;

    let alerts = p.alerts(ResolvedFilter::All).await;
    assert_eq!(alerts.len(), 2);
    let severity_of = |id: &str| {
        alerts
            .iter()
            .find(|a| a.device_id == id)
            .map(|a| a.severity)
    };
    assert_eq!(severity_of("b9"), Some(Severity::Critical));
    assert_eq!(severity_of("b15"), Some(Severity::Warning));
    assert_eq!(severity_of("b25"), None);
}

#[tokio::test]
async fn test_moisture_alert_clears_at_25_not_24() {
    let p = pipeline(vec![device("soil-1", "soil_sensor")]);

    p.telemetry("soil-1", json!({ "moisture": 10 })).await;
    assert_eq!(p.alerts(ResolvedFilter::False).await.len(), 1);

    p.telemetry("soil-1", json!({ "moisture": 24 })).await;
    assert_eq!(p.alerts(ResolvedFilter::False).await.len(), 1);

    p.telemetry("soil-1", json!({ "moisture": 25 })).await;
    assert!(p.alerts(ResolvedFilter::False).await.is_empty());

    let resolved = p.alerts(ResolvedFilter::True).await;
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].resolved_by.as_deref(), Some(SYSTEM_RESOLVER));
    assert!(resolved[0].resolved_at.is_some());
    assert!(resolved[0].resolution_notes.is_some());
}

#[tokio::test]
async fn test_unknown_topic_leaves_no_trace() {
    let p = pipeline(vec![device("soil-1", "soil_sensor")]);
    let before = p.device("soil-1").await;

    let disposition = p
        .send(
            "stranger",
            json!({
                "type": "telemetry",
                "data": { "moisture": 1 },
                "battery": { "level": 1, "charging": false }
            }),
        )
        .await;

    assert_eq!(disposition, Disposition::Ignored(IgnoreReason::UnknownDevice));
    assert_eq!(p.store.telemetry_count().await, 0);
    assert_eq!(p.store.alert_count().await, 0);
    assert_eq!(p.device("soil-1").await, before);
}

#[tokio::test]
async fn test_bogus_type_does_not_block_next_message() {
    let p = pipeline(vec![device("soil-1", "soil_sensor")]);

    assert_eq!(
        p.send("soil-1", json!({ "type": "bogus", "data": {} })).await,
        Disposition::Ignored(IgnoreReason::UnknownType)
    );
    assert_eq!(
        p.telemetry("soil-1", json!({ "moisture": 60 })).await,
        Disposition::Processed(MessageKind::Telemetry)
    );
    assert_eq!(p.store.telemetry_count().await, 1);
}

#[tokio::test]
async fn test_summary_aggregation() {
    let p = pipeline(vec![device("dev-a", "camera"), device("dev-b", "camera")]);
    let alerts: Arc<dyn AlertStore> = p.store.clone();

    let open = |device_id: &str, alert_type: AlertType, parameter: &str| NewAlert {
        device_id: device_id.to_string(),
        alert_type,
        severity: Severity::Warning,
        message: "seeded".to_string(),
        telemetry_data: json!({ "parameter": parameter }),
    };
    for alert in [
        open("dev-a", AlertType::LowBattery, "primary"),
        open("dev-a", AlertType::LowBattery, "backup"),
        open("dev-a", AlertType::Offline, ""),
        open("dev-b", AlertType::ConnectivityIssue, ""),
    ] {
        assert!(alerts.create_unique(alert).await.unwrap().is_some());
    }

    let summary = p.service.get_alerts_summary(None).await.unwrap();
    assert_eq!(summary.unresolved, 4);

    let by_type = serde_json::to_value(&summary.by_type).unwrap();
    assert_eq!(by_type[0], json!({ "type": "low_battery", "count": 2 }));
    assert!(by_type
        .as_array()
        .unwrap()
        .contains(&json!({ "type": "offline", "count": 1 })));

    let top = &summary.top_devices[0];
    assert_eq!(top.device_id, "dev-a");
    assert_eq!(top.device_name, "Device dev-a");
    assert_eq!(top.count, 3);

    let scoped = p.service.get_alerts_summary(Some("dev-b")).await.unwrap();
    assert_eq!(scoped.unresolved, 1);
    assert_eq!(scoped.top_devices.len(), 1);
}

#[tokio::test]
async fn test_soil_sensor_dry_then_wet() {
    let p = pipeline(vec![device("soil-7", "soil_sensor")]);

    p.telemetry("soil-7", json!({ "moisture": 15 })).await;
    let alerts = p.alerts(ResolvedFilter::All).await;
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.alert_type, AlertType::ThresholdBelow);
    assert_eq!(alert.severity, Severity::Critical);
    assert_eq!(alert.telemetry_data["parameter"], "moisture");
    assert_eq!(alert.telemetry_data["value"], 15.0);
    assert_eq!(alert.telemetry_data["threshold"], 20.0);

    p.telemetry("soil-7", json!({ "moisture": 26 })).await;
    let alerts = p.alerts(ResolvedFilter::All).await;
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].resolved);

    let device = p.device("soil-7").await;
    assert_eq!(device.status, DeviceStatus::Active);
}

#[tokio::test]
async fn test_manual_resolution_hides_alert_from_open_list() {
    let p = pipeline(vec![device("ws-1", "weather_station")]);

    p.telemetry("ws-1", json!({ "temperature": 45 })).await;
    let open = p.alerts(ResolvedFilter::False).await;
    assert_eq!(open.len(), 1);

    let resolved = p
        .service
        .resolve_alert(open[0].id, "operator", Some("vent opened".to_string()))
        .await
        .unwrap();
    assert!(resolved.resolved);
    assert!(resolved.resolved_at.is_some());
    assert_eq!(resolved.resolved_by.as_deref(), Some("operator"));

    assert!(p.alerts(ResolvedFilter::False).await.is_empty());

    // A new breach opens a fresh alert once the old one is closed
    p.telemetry("ws-1", json!({ "temperature": 46 })).await;
    assert_eq!(p.alerts(ResolvedFilter::False).await.len(), 1);
    assert_eq!(p.alerts(ResolvedFilter::All).await.len(), 2);
}

#[tokio::test]
async fn test_concurrent_breaches_keep_one_open_alert() {
    let p = Arc::new(pipeline(vec![device("ws-2", "weather_station")]));

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let p = p.clone();
            tokio::spawn(async move {
                p.telemetry("ws-2", json!({ "temperature": 41 + i })).await;
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(p.alerts(ResolvedFilter::False).await.len(), 1);
}
