use crate::envelope::TelemetryMessage;
use crate::errors::{Error, Result};
use crate::model::Battery;

const BATTERY_MIN: f64 = 0.0;
const BATTERY_MAX: f64 = 100.0;
const LATITUDE_MIN: f64 = -90.0;
const LATITUDE_MAX: f64 = 90.0;
const LONGITUDE_MIN: f64 = -180.0;
const LONGITUDE_MAX: f64 = 180.0;

/// Validates an inbound telemetry payload
pub fn validate(telemetry: &TelemetryMessage) -> Result<()> {
    // Validate readings
    if let Some((parameter, value)) = telemetry.data.iter().find(|(_, v)| !v.is_finite()) {
        return Err(Error::Validation(format!(
            "Reading {} has non-finite value {}",
            parameter, value
        )));
    }

    if let Some(battery) = &telemetry.battery {
        validate_battery(battery)?;
    }

    // Validate location
    if let Some(location) = &telemetry.location {
        if !(LATITUDE_MIN..=LATITUDE_MAX).contains(&location.latitude) {
            return Err(Error::Validation(format!(
                "Latitude {} out of range [{}, {}]",
                location.latitude, LATITUDE_MIN, LATITUDE_MAX
            )));
        }
        if !(LONGITUDE_MIN..=LONGITUDE_MAX).contains(&location.longitude) {
            return Err(Error::Validation(format!(
                "Longitude {} out of range [{}, {}]",
                location.longitude, LONGITUDE_MIN, LONGITUDE_MAX
            )));
        }
    }

    if let Some(signal) = telemetry.signal_strength {
        if !signal.is_finite() {
            return Err(Error::Validation("Signal strength must be finite".to_string()));
        }
    }

    Ok(())
}

pub fn validate_battery(battery: &Battery) -> Result<()> {
    if !(BATTERY_MIN..=BATTERY_MAX).contains(&battery.level) {
        return Err(Error::Validation(format!(
            "Battery {} out of range [{}, {}]",
            battery.level, BATTERY_MIN, BATTERY_MAX
        )));
    }
    Ok(())
}
