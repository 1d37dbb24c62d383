use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};

const DEFAULT_FIRMWARE: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    SoilSensor,
    WeatherStation,
    Camera,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [
        DeviceKind::SoilSensor,
        DeviceKind::WeatherStation,
        DeviceKind::Camera,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::SoilSensor => "soil_sensor",
            DeviceKind::WeatherStation => "weather_station",
            DeviceKind::Camera => "camera",
        }
    }
}

/// One simulated device with a slowly draining battery.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub id: String,
    pub kind: DeviceKind,
    pub topic: String,
    battery: f64,
    charging: bool,
}

impl SimDevice {
    pub fn new(index: usize, prefix: &str, rng: &mut impl Rng) -> Self {
        let kind = DeviceKind::ALL[index % DeviceKind::ALL.len()];
        let id = format!("sim-{}-{}", kind.as_str().replace('_', "-"), index);
        Self {
            topic: format!("{}/{}", prefix, id),
            id,
            kind,
            battery: rng.gen_range(30.0..100.0),
            charging: false,
        }
    }

    pub fn battery_level(&self) -> f64 {
        self.battery
    }

    /// Advance the battery: drain until nearly empty, then charge back up.
    fn tick_battery(&mut self, rng: &mut impl Rng) {
        if self.charging {
            self.battery = (self.battery + rng.gen_range(1.0..4.0)).min(100.0);
            if self.battery >= 95.0 {
                self.charging = false;
            }
        } else {
            self.battery = (self.battery - rng.gen_range(0.1..1.5)).max(0.0);
            if self.battery < 8.0 {
                self.charging = true;
            }
        }
    }

    pub fn telemetry(&mut self, rng: &mut impl Rng) -> Value {
        self.tick_battery(rng);

        let data = match self.kind {
            DeviceKind::SoilSensor => {
                // Occasional dry spell
                let moisture = if rng.gen_bool(0.05) {
                    rng.gen_range(5.0..19.0)
                } else {
                    rng.gen_range(25.0..60.0)
                };
                json!({ "moisture": round(moisture), "temperature": round(rng.gen_range(10.0..30.0)) })
            }
            DeviceKind::WeatherStation => {
                // Occasional heat spike
                let temperature = if rng.gen_bool(0.05) {
                    rng.gen_range(41.0..48.0)
                } else {
                    rng.gen_range(15.0..35.0)
                };
                json!({
                    "temperature": round(temperature),
                    "humidity": round(rng.gen_range(30.0..80.0)),
                    "windSpeed": round(rng.gen_range(0.0..25.0)),
                })
            }
            DeviceKind::Camera => json!({
                "fps": round(rng.gen_range(15.0..30.0)),
                "motion": if rng.gen_bool(0.1) { 1.0 } else { 0.0 },
            }),
        };

        json!({
            "type": "telemetry",
            "data": data,
            "battery": { "level": round(self.battery), "charging": self.charging },
            "signalStrength": round(rng.gen_range(-90.0..-40.0)),
            "timestamp": Utc::now(),
        })
    }

    pub fn status(&self, rng: &mut impl Rng) -> Value {
        let status = match rng.gen_range(0..100) {
            0..=1 => "error",
            2..=4 => "offline",
            _ => "active",
        };
        json!({
            "type": "status",
            "status": status,
            "battery": { "level": round(self.battery), "charging": self.charging },
            "timestamp": Utc::now(),
        })
    }

    /// An occasional device-side alert, such as a tamper switch firing.
    pub fn alert(&self, rng: &mut impl Rng) -> Option<Value> {
        if !rng.gen_bool(0.01) {
            return None;
        }
        let (alert_type, message) = match self.kind {
            DeviceKind::Camera => ("tamper_detected", "Lens cover opened"),
            DeviceKind::SoilSensor => ("maintenance_required", "Probe needs cleaning"),
            DeviceKind::WeatherStation => ("maintenance_required", "Anemometer bearing worn"),
        };
        Some(json!({
            "type": "alert",
            "alertType": alert_type,
            "severity": "warning",
            "message": message,
            "timestamp": Utc::now(),
        }))
    }
}

/// Reply to a message on one of a device's control topics, if it needs one.
pub fn control_reply(topic: &str, payload: &[u8]) -> Option<(String, Value)> {
    if let Some(device_topic) = topic.strip_suffix("/ping") {
        let reply = json!({ "type": "pong", "timestamp": Utc::now() });
        return Some((format!("{}/pong", device_topic), reply));
    }

    let device_topic = topic.strip_suffix("/commands")?;
    let command: Value = serde_json::from_slice(payload).ok()?;
    let name = command.get("command")?.as_str()?.to_string();
    let data = if name == "firmware_update" {
        let version = command
            .pointer("/data/version")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_FIRMWARE);
        json!({ "version": version })
    } else {
        json!({})
    };
    let reply = json!({
        "type": "command_response",
        "command": name,
        "status": "success",
        "data": data,
        "timestamp": Utc::now(),
    });
    Some((device_topic.to_string(), reply))
}

fn round(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_device_kinds_rotate() {
        let mut rng = StdRng::seed_from_u64(7);
        let kinds: Vec<DeviceKind> = (0..4)
            .map(|i| SimDevice::new(i, "iot/devices", &mut rng).kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                DeviceKind::SoilSensor,
                DeviceKind::WeatherStation,
                DeviceKind::Camera,
                DeviceKind::SoilSensor
            ]
        );
        let device = SimDevice::new(1, "iot/devices", &mut rng);
        assert_eq!(device.topic, "iot/devices/sim-weather-station-1");
    }

    #[test]
    fn test_battery_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut device = SimDevice::new(0, "iot/devices", &mut rng);
        for _ in 0..1000 {
            let telemetry = device.telemetry(&mut rng);
            assert_eq!(telemetry["type"], "telemetry");
            let level = device.battery_level();
            assert!((0.0..=100.0).contains(&level), "battery {}", level);
        }
    }

    #[test]
    fn test_soil_sensor_reports_moisture() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut device = SimDevice::new(0, "iot/devices", &mut rng);
        let telemetry = device.telemetry(&mut rng);
        assert!(telemetry["data"]["moisture"].is_f64());
    }

    #[test]
    fn test_alerts_are_rare_and_well_formed() {
        let mut rng = StdRng::seed_from_u64(3);
        let device = SimDevice::new(2, "iot/devices", &mut rng);
        let alerts: Vec<Value> = (0..5000).filter_map(|_| device.alert(&mut rng)).collect();
        assert!(!alerts.is_empty());
        assert!(alerts.len() < 200);
        assert!(alerts.iter().all(|a| a["alertType"] == "tamper_detected"));
    }

    #[test]
    fn test_ping_gets_pong() {
        let (topic, reply) = control_reply("iot/devices/d1/ping", b"{}").unwrap();
        assert_eq!(topic, "iot/devices/d1/pong");
        assert_eq!(reply["type"], "pong");
    }

    #[test]
    fn test_firmware_update_gets_response() {
        let payload = br#"{"type":"command","command":"firmware_update","data":{"version":"2.1.0"}}"#;
        let (topic, reply) = control_reply("iot/devices/d1/commands", payload).unwrap();
        assert_eq!(topic, "iot/devices/d1");
        assert_eq!(reply["type"], "command_response");
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["data"]["version"], "2.1.0");
    }

    #[test]
    fn test_other_topics_get_no_reply() {
        assert!(control_reply("iot/devices/d1", b"{}").is_none());
        assert!(control_reply("iot/devices/d1/commands", b"not json").is_none());
    }
}
