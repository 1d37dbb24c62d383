use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    /// Missing device or alert, as opposed to a failure reaching it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::DeviceNotFound(_) | Error::AlertNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
