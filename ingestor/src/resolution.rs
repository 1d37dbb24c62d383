use crate::errors::{Error, Result};
use crate::metrics::ALERTS_RESOLVED_TOTAL;
use crate::model::{AlertType, Resolution, TelemetryRecord, SYSTEM_RESOLVER};
use crate::rules::RuleRegistry;
use crate::store::{AlertStore, DeviceStore};
use std::sync::Arc;
use tracing::info;

pub struct AutoResolver {
    devices: Arc<dyn DeviceStore>,
    alerts: Arc<dyn AlertStore>,
    rules: Arc<RuleRegistry>,
}

impl AutoResolver {
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

    /// Resolve open alerts whose clearing condition this reading satisfies.
    /// Each rule is checked on its own. Returns the number of alerts closed.
    pub async fn auto_resolve(&self, record: &TelemetryRecord) -> Result<u64> {
        let device = self
            .devices
            .find_by_id(&record.device_id)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(record.device_id.clone()))?;

        let mut resolved = 0;

        if let Some(battery) = &record.battery {
            if self.rules.battery().is_recovered(battery) {
                let resolution =
                    Resolution::system(format!("Battery level recovered to {}%", battery.level));
                resolved += self
                    .alerts
                    .resolve_open(&device.id, AlertType::LowBattery, None, resolution)
                    .await?;
            }
        }

        for rule in self.rules.rules_for(&device.device_type) {
            let Some(value) = record.reading(&rule.parameter) else {
                continue;
            };
            if !rule.resolve.holds(value) {
                continue;
            }
            let resolution = Resolution::system(rule.resolution_note(value));
            resolved += self
                .alerts
                .resolve_open(
                    &device.id,
                    rule.alert_type,
                    Some(rule.parameter.as_str()),
                    resolution,
                )
                .await?;
        }

        if resolved > 0 {
            ALERTS_RESOLVED_TOTAL
                .with_label_values(&[SYSTEM_RESOLVER])
                .inc_by(resolved as f64);
            info!(device_id = %device.id, count = resolved, "Auto-resolved alerts");
        }

        Ok(resolved)
    }
}
