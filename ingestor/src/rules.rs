use crate::model::{AlertType, Battery, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Below,
    Above,
    AtLeast,
    AtMost,
}

impl Comparison {
    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Below => value < threshold,
            Comparison::Above => value > threshold,
            Comparison::AtLeast => value >= threshold,
            Comparison::AtMost => value <= threshold,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparison::Below => "below",
            Comparison::Above => "above",
            Comparison::AtLeast => "at or above",
            Comparison::AtMost => "at or below",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub comparison: Comparison,
    pub threshold: f64,
}

impl Condition {
    pub const fn new(comparison: Comparison, threshold: f64) -> Self {
        Self {
            comparison,
            threshold,
        }
    }

    pub fn holds(&self, value: f64) -> bool {
        self.comparison.holds(value, self.threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub parameter: String,
    pub trigger: Condition,
    pub resolve: Condition,
    pub alert_type: AlertType,
    pub severity: Severity,
}

impl ThresholdRule {
    pub fn alert_message(&self, device_name: &str, value: f64) -> String {
        format!(
            "{} on {} is {} {}: {}",
            self.parameter, device_name, self.trigger.comparison, self.trigger.threshold, value
        )
    }

    pub fn resolution_note(&self, value: f64) -> String {
        format!(
            "{} returned to {} ({} {})",
            self.parameter, value, self.resolve.comparison, self.resolve.threshold
        )
    }
}

/// Battery thresholds, shared by every device type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryPolicy {
    /// Alert when the level drops below this and the device is not charging.
    pub low: f64,
    /// Below this the alert is critical instead of a warning.
    pub critical: f64,
    /// Open low battery alerts close once the level rises above this.
    pub recovered: f64,
}

impl Default for BatteryPolicy {
    fn default() -> Self {
        Self {
            low: 20.0,
            critical: 10.0,
            recovered: 30.0,
        }
    }
}

impl BatteryPolicy {
    /// Severity of the alert this battery state warrants, if any.
    pub fn evaluate(&self, battery: &Battery) -> Option<Severity> {
        if battery.charging || battery.level >= self.low {
            return None;
        }
        if battery.level < self.critical {
            Some(Severity::Critical)
        } else {
            Some(Severity::Warning)
        }
    }

    pub fn is_recovered(&self, battery: &Battery) -> bool {
        battery.level > self.recovered
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleRegistry {
    battery: BatteryPolicy,
    rules: HashMap<String, Vec<ThresholdRule>>,
}

impl RuleRegistry {
    /// A registry without any device-type rules.
    pub fn empty() -> Self {
        Self {
            battery: BatteryPolicy::default(),
            rules: HashMap::new(),
        }
    }

    pub fn battery(&self) -> &BatteryPolicy {
        &self.battery
    }

    pub fn set_battery(&mut self, battery: BatteryPolicy) {
        self.battery = battery;
    }

    /// Append a rule to a device type's list.
    pub fn register(&mut self, device_type: impl Into<String>, rule: ThresholdRule) {
        self.rules.entry(device_type.into()).or_default().push(rule);
    }

    pub fn rules_for(&self, device_type: &str) -> &[ThresholdRule] {
        self.rules
            .get(device_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn device_types(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "soil_sensor",
            ThresholdRule {
                parameter: "moisture".to_string(),
                trigger: Condition::new(Comparison::Below, 20.0),
                resolve: Condition::new(Comparison::AtLeast, 25.0),
                alert_type: AlertType::ThresholdBelow,
                severity: Severity::Critical,
            },
        );
        registry.register(
            "weather_station",
            ThresholdRule {
                parameter: "temperature".to_string(),
                trigger: Condition::new(Comparison::Above, 40.0),
                resolve: Condition::new(Comparison::AtMost, 35.0),
                alert_type: AlertType::ThresholdExceeded,
                severity: Severity::Critical,
            },
        );
        registry
    }
}
