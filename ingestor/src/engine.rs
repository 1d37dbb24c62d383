use crate::errors::{Error, Result};
use crate::metrics::{ALERTS_CREATED_TOTAL, ALERTS_SUPPRESSED_TOTAL};
use crate::model::{Alert, AlertType, NewAlert, TelemetryRecord};
use crate::rules::RuleRegistry;
use crate::store::{AlertStore, DeviceStore};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

pub struct AlertEngine {
    devices: Arc<dyn DeviceStore>,
    alerts: Arc<dyn AlertStore>,
    rules: Arc<RuleRegistry>,
}

impl AlertEngine {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        alerts: Arc<dyn AlertStore>,
        rules: Arc<RuleRegistry>,
    ) -> Self {
        Self {
            devices,
            alerts,
            rules,
        }
    }

    /// Evaluate the battery policy and the device type's threshold rules
    /// against a recorded reading. Returns the alerts that were created.
    pub async fn evaluate(&self, record: &TelemetryRecord) -> Result<Vec<Alert>> {
        let device = self
            .devices
            .find_by_id(&record.device_id)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(record.device_id.clone()))?;

        let mut created = Vec::new();

        if let Some(battery) = &record.battery {
            let policy = self.rules.battery();
            if let Some(severity) = policy.evaluate(battery) {
                let alert = NewAlert {
                    device_id: device.id.clone(),
                    alert_type: AlertType::LowBattery,
                    severity,
                    message: format!("Low battery on {}: {}%", device.name, battery.level),
                    telemetry_data: json!({
                        "level": battery.level,
                        "charging": battery.charging,
                        "threshold": policy.low,
                        "telemetry_id": record.id,
                    }),
                };
                created.extend(self.raise(alert).await?);
            }
        }

        for rule in self.rules.rules_for(&device.device_type) {
            let Some(value) = record.reading(&rule.parameter) else {
                continue;
            };
            if !rule.trigger.holds(value) {
                continue;
            }
            let alert = NewAlert {
                device_id: device.id.clone(),
                alert_type: rule.alert_type,
                severity: rule.severity,
                message: rule.alert_message(&device.name, value),
                telemetry_data: json!({
                    "parameter": rule.parameter,
                    "value": value,
                    "threshold": rule.trigger.threshold,
                    "telemetry_id": record.id,
                }),
            };
            created.extend(self.raise(alert).await?);
        }

        Ok(created)
    }

    /// Insert an alert unless an open one with the same key exists.
    pub async fn raise(&self, alert: NewAlert) -> Result<Option<Alert>> {
        let device_id = alert.device_id.clone();
        let alert_type = alert.alert_type;
        let parameter = alert.parameter().map(str::to_string);

        match self.alerts.create_unique(alert).await? {
            Some(alert) => {
                ALERTS_CREATED_TOTAL
                    .with_label_values(&[alert.alert_type.as_str()])
                    .inc();
                info!(
                    alert_id = %alert.id,
                    device_id = %alert.device_id,
                    alert_type = %alert.alert_type,
                    severity = %alert.severity,
                    "Alert created"
                );
                Ok(Some(alert))
            }
            None => {
                ALERTS_SUPPRESSED_TOTAL.inc();
                debug!(
                    device_id = %device_id,
                    alert_type = %alert_type,
                    parameter = parameter.as_deref().unwrap_or("-"),
                    "Open alert already exists, not creating another"
                );
                Ok(None)
            }
        }
    }
}
