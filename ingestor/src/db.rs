use crate::errors::{Error, Result};
use crate::metrics::DB_RETRIES_TOTAL;
use crate::model::{
    Alert, AlertAggregates, AlertPage, AlertQuery, AlertType, Battery, Device, DeviceUpdate,
    Firmware, Location, NewAlert, NewTelemetry, Pagination, Resolution, ResolvedFilter,
    TelemetryQuery, TelemetryRecord,
};
use crate::store::{AlertStore, DeviceStore, TelemetryStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_ATTEMPTS: u32 = 5;
const TOP_DEVICES: i64 = 10;

const DEVICE_COLUMNS: &str = "id, name, device_type, topic, status, last_communication, \
     battery_level, battery_charging, firmware_version, firmware_last_updated";
const TELEMETRY_COLUMNS: &str = "id, device_id, ts, readings, battery_level, battery_charging, \
     signal_strength, latitude, longitude, metadata";
const ALERT_COLUMNS: &str = "id, device_id, alert_type, severity, message, ts, resolved, \
     resolved_at, resolved_by, resolution_notes, telemetry_data, notification_sent, \
     notification_timestamp";

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Run a statement, retrying transient failures with exponential backoff.
async fn with_retry<T, F, Fut>(operation: &str, mut run: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match run().await {
            Ok(value) => return Ok(value),
            Err(db_err) => {
                if attempts >= MAX_ATTEMPTS || !is_transient_error(&db_err) {
                    if attempts > 1 {
                        error!(
                            "Database {} failed permanently after {} attempts: {}",
                            operation, attempts, db_err
                        );
                    }
                    return Err(Error::Database(db_err));
                }

                let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                warn!(
                    "Database {} failed (attempt {}/{}), retrying in {}ms: {}",
                    operation, attempts, MAX_ATTEMPTS, wait_ms, db_err
                );
                DB_RETRIES_TOTAL.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
        }
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

#[derive(Debug, FromRow)]
struct DeviceRow {
    id: String,
    name: String,
    device_type: String,
    topic: String,
    status: String,
    last_communication: Option<DateTime<Utc>>,
    battery_level: Option<f64>,
    battery_charging: bool,
    firmware_version: Option<String>,
    firmware_last_updated: Option<DateTime<Utc>>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self> {
        Ok(Device {
            status: row.status.parse()?,
            battery: row.battery_level.map(|level| Battery {
                level,
                charging: row.battery_charging,
            }),
            id: row.id,
            name: row.name,
            device_type: row.device_type,
            topic: row.topic,
            last_communication: row.last_communication,
            firmware: Firmware {
                version: row.firmware_version,
                last_updated: row.firmware_last_updated,
            },
        })
    }
}

#[derive(Debug, FromRow)]
struct TelemetryRow {
    id: Uuid,
    device_id: String,
    ts: DateTime<Utc>,
    readings: Json<BTreeMap<String, f64>>,
    battery_level: Option<f64>,
    battery_charging: Option<bool>,
    signal_strength: Option<f64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    metadata: Json<serde_json::Value>,
}

impl From<TelemetryRow> for TelemetryRecord {
    fn from(row: TelemetryRow) -> Self {
        TelemetryRecord {
            id: row.id,
            device_id: row.device_id,
            readings: row.readings.0,
            timestamp: row.ts,
            battery: row.battery_level.map(|level| Battery {
                level,
                charging: row.battery_charging.unwrap_or(false),
            }),
            signal_strength: row.signal_strength,
            location: row
                .latitude
                .zip(row.longitude)
                .map(|(latitude, longitude)| Location {
                    latitude,
                    longitude,
                }),
            metadata: row.metadata.0,
        }
    }
}

#[derive(Debug, FromRow)]
struct AlertRow {
    id: Uuid,
    device_id: String,
    alert_type: String,
    severity: String,
    message: String,
    ts: DateTime<Utc>,
    resolved: bool,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<String>,
    resolution_notes: Option<String>,
    telemetry_data: Json<serde_json::Value>,
    notification_sent: bool,
    notification_timestamp: Option<DateTime<Utc>>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = Error;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Alert {
            id: row.id,
            device_id: row.device_id,
            alert_type: row.alert_type.parse()?,
            severity: row.severity.parse()?,
            message: row.message,
            timestamp: row.ts,
            resolved: row.resolved,
            resolved_at: row.resolved_at,
            resolved_by: row.resolved_by,
            resolution_notes: row.resolution_notes,
            telemetry_data: row.telemetry_data.0,
            notification_sent: row.notification_sent,
            notification_timestamp: row.notification_timestamp,
        })
    }
}

fn push_alert_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &AlertQuery) {
    qb.push(" WHERE TRUE");
    if let Some(device_id) = &query.device_id {
        qb.push(" AND device_id = ").push_bind(device_id.clone());
    }
    match query.resolved {
        ResolvedFilter::All => {}
        ResolvedFilter::True => {
            qb.push(" AND resolved");
        }
        ResolvedFilter::False => {
            qb.push(" AND NOT resolved");
        }
    }
    if let Some(severity) = query.severity {
        qb.push(" AND severity = ").push_bind(severity.as_str());
    }
    if let Some(alert_type) = query.alert_type {
        qb.push(" AND alert_type = ").push_bind(alert_type.as_str());
    }
    if let Some(start) = query.start {
        qb.push(" AND ts >= ").push_bind(start);
    }
    if let Some(end) = query.end {
        qb.push(" AND ts <= ").push_bind(end);
    }
}

/// Postgres-backed store for devices, telemetry and alerts.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self {
            pool: make_pool(database_url).await?,
        })
    }

    /// Insert `candidate` unless its (device, type, parameter) slot is taken.
    /// Safe to repeat with the same candidate.
    async fn insert_open_alert(&self, candidate: &Alert) -> Result<Option<Alert>> {
        let sql = format!(
            "INSERT INTO alerts (id, device_id, alert_type, severity, message, ts, resolved, \
                 parameter, telemetry_data, notification_sent) \
             VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7, $8, FALSE) \
             ON CONFLICT DO NOTHING \
             RETURNING {}",
            ALERT_COLUMNS
        );
        // The partial unique index on open alerts turns a duplicate into a no-op.
        let (sql, pool, a) = (&sql, &self.pool, candidate);
        let row = with_retry("alert insert", move || async move {
            sqlx::query_as::<_, AlertRow>(sql)
                .bind(a.id)
                .bind(&a.device_id)
                .bind(a.alert_type.as_str())
                .bind(a.severity.as_str())
                .bind(&a.message)
                .bind(a.timestamp)
                .bind(a.parameter())
                .bind(Json(&a.telemetry_data))
                .fetch_optional(pool)
                .await
        })
        .await?;
        match row {
            Some(row) => Alert::try_from(row).map(Some),
            // A retry can conflict with its own committed first attempt.
            None => AlertStore::find_by_id(self, candidate.id).await,
        }
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>> {
        let sql = format!("SELECT {} FROM devices WHERE id = $1", DEVICE_COLUMNS);
        let (sql, pool) = (&sql, &self.pool);
        let row = with_retry("device lookup", move || async move {
            sqlx::query_as::<_, DeviceRow>(sql)
                .bind(id)
                .fetch_optional(pool)
                .await
        })
        .await?;
        row.map(Device::try_from).transpose()
    }

    async fn find_by_topic(&self, topic: &str) -> Result<Option<Device>> {
        let sql = format!("SELECT {} FROM devices WHERE topic = $1", DEVICE_COLUMNS);
        let (sql, pool) = (&sql, &self.pool);
        let row = with_retry("device lookup", move || async move {
            sqlx::query_as::<_, DeviceRow>(sql)
                .bind(topic)
                .fetch_optional(pool)
                .await
        })
        .await?;
        row.map(Device::try_from).transpose()
    }

    async fn update(&self, id: &str, update: DeviceUpdate) -> Result<Option<Device>> {
        let sql = format!(
            "UPDATE devices SET \
                status = COALESCE($2, status), \
                last_communication = COALESCE($3, last_communication), \
                battery_level = COALESCE($4, battery_level), \
                battery_charging = COALESCE($5, battery_charging), \
                firmware_version = COALESCE($6, firmware_version), \
                firmware_last_updated = COALESCE($7, firmware_last_updated) \
             WHERE id = $1 RETURNING {}",
            DEVICE_COLUMNS
        );
        let (sql, pool, update) = (&sql, &self.pool, &update);
        let row = with_retry("device update", move || async move {
            sqlx::query_as::<_, DeviceRow>(sql)
                .bind(id)
                .bind(update.status.map(|s| s.as_str()))
                .bind(update.last_communication)
                .bind(update.battery.map(|b| b.level))
                .bind(update.battery.map(|b| b.charging))
                .bind(update.firmware_version.as_deref())
                .bind(update.firmware_last_updated)
                .fetch_optional(pool)
                .await
        })
        .await?;
        row.map(Device::try_from).transpose()
    }

    async fn upsert(&self, device: Device) -> Result<()> {
        let (pool, device) = (&self.pool, &device);
        with_retry("device upsert", move || async move {
            sqlx::query(
                "INSERT INTO devices (id, name, device_type, topic, status, last_communication, \
                     battery_level, battery_charging, firmware_version, firmware_last_updated) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (id) DO UPDATE SET \
                     name = EXCLUDED.name, device_type = EXCLUDED.device_type, \
                     topic = EXCLUDED.topic, \
                     battery_level = COALESCE(devices.battery_level, EXCLUDED.battery_level), \
                     battery_charging = CASE WHEN devices.battery_level IS NULL \
                         THEN EXCLUDED.battery_charging ELSE devices.battery_charging END, \
                     firmware_version = COALESCE(devices.firmware_version, EXCLUDED.firmware_version)",
            )
            .bind(&device.id)
            .bind(&device.name)
            .bind(&device.device_type)
            .bind(&device.topic)
            .bind(device.status.as_str())
            .bind(device.last_communication)
            .bind(device.battery.map(|b| b.level))
            .bind(device.battery.is_some_and(|b| b.charging))
            .bind(device.firmware.version.as_deref())
            .bind(device.firmware.last_updated)
            .execute(pool)
            .await
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TelemetryStore for PgStore {
    async fn create(&self, telemetry: NewTelemetry) -> Result<TelemetryRecord> {
        let record = TelemetryRecord::from_new(telemetry);
        let (pool, r) = (&self.pool, &record);
        // Replays of the same id after a lost acknowledgement are no-ops.
        with_retry("telemetry insert", move || async move {
            sqlx::query(
                "INSERT INTO telemetry (id, device_id, ts, readings, battery_level, \
                     battery_charging, signal_strength, latitude, longitude, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(r.id)
            .bind(&r.device_id)
            .bind(r.timestamp)
            .bind(Json(&r.readings))
            .bind(r.battery.map(|b| b.level))
            .bind(r.battery.map(|b| b.charging))
            .bind(r.signal_strength)
            .bind(r.location.map(|l| l.latitude))
            .bind(r.location.map(|l| l.longitude))
            .bind(Json(&r.metadata))
            .execute(pool)
            .await
        })
        .await?;
        Ok(record)
    }

    async fn query(&self, query: &TelemetryQuery) -> Result<Vec<TelemetryRecord>> {
        let pool = &self.pool;
        let rows = with_retry("telemetry query", move || async move {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT {} FROM telemetry WHERE TRUE",
                TELEMETRY_COLUMNS
            ));
            if let Some(device_id) = &query.device_id {
                qb.push(" AND device_id = ").push_bind(device_id.clone());
            }
            if let Some(start) = query.start {
                qb.push(" AND ts >= ").push_bind(start);
            }
            if let Some(end) = query.end {
                qb.push(" AND ts <= ").push_bind(end);
            }
            qb.push(" ORDER BY ts DESC LIMIT ")
                .push_bind(query.limit as i64)
                .push(" OFFSET ")
                .push_bind(query.offset as i64);
            qb.build_query_as::<TelemetryRow>().fetch_all(pool).await
        })
        .await?;
        Ok(rows.into_iter().map(TelemetryRecord::from).collect())
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn create_unique(&self, alert: NewAlert) -> Result<Option<Alert>> {
        self.insert_open_alert(&Alert::from_new(alert)).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Alert>> {
        let sql = format!("SELECT {} FROM alerts WHERE id = $1", ALERT_COLUMNS);
        let (sql, pool) = (&sql, &self.pool);
        let row = with_retry("alert lookup", move || async move {
            sqlx::query_as::<_, AlertRow>(sql)
                .bind(id)
                .fetch_optional(pool)
                .await
        })
        .await?;
        row.map(Alert::try_from).transpose()
    }

    async fn resolve(&self, id: Uuid, resolution: Resolution) -> Result<Option<Alert>> {
        let sql = format!(
            "UPDATE alerts SET resolved = TRUE, resolved_at = $2, resolved_by = $3, \
                 resolution_notes = $4 \
             WHERE id = $1 RETURNING {}",
            ALERT_COLUMNS
        );
        let (sql, pool, resolution) = (&sql, &self.pool, &resolution);
        let row = with_retry("alert resolve", move || async move {
            sqlx::query_as::<_, AlertRow>(sql)
                .bind(id)
                .bind(resolution.at)
                .bind(&resolution.by)
                .bind(resolution.notes.as_deref())
                .fetch_optional(pool)
                .await
        })
        .await?;
        row.map(Alert::try_from).transpose()
    }

    async fn resolve_open(
        &self,
        device_id: &str,
        alert_type: AlertType,
        parameter: Option<&str>,
        resolution: Resolution,
    ) -> Result<u64> {
        let (pool, resolution) = (&self.pool, &resolution);
        let result = with_retry("alert auto-resolve", move || async move {
            sqlx::query(
                "UPDATE alerts SET resolved = TRUE, resolved_at = $4, resolved_by = $5, \
                     resolution_notes = $6 \
                 WHERE NOT resolved AND device_id = $1 AND alert_type = $2 \
                   AND ($3::text IS NULL OR parameter = $3)",
            )
            .bind(device_id)
            .bind(alert_type.as_str())
            .bind(parameter)
            .bind(resolution.at)
            .bind(&resolution.by)
            .bind(resolution.notes.as_deref())
            .execute(pool)
            .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let pool = &self.pool;
        let result = with_retry("alert delete", move || async move {
            sqlx::query("DELETE FROM alerts WHERE id = $1")
                .bind(id)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, query: &AlertQuery) -> Result<AlertPage> {
        let pool = &self.pool;
        let total: i64 = with_retry("alert count", move || async move {
            let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM alerts");
            push_alert_filters(&mut qb, query);
            qb.build_query_scalar::<i64>().fetch_one(pool).await
        })
        .await?;

        let rows = with_retry("alert query", move || async move {
            let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM alerts", ALERT_COLUMNS));
            push_alert_filters(&mut qb, query);
            qb.push(" ORDER BY ts DESC LIMIT ")
                .push_bind(query.limit as i64)
                .push(" OFFSET ")
                .push_bind(query.offset() as i64);
            qb.build_query_as::<AlertRow>().fetch_all(pool).await
        })
        .await?;

        Ok(AlertPage {
            alerts: rows
                .into_iter()
                .map(Alert::try_from)
                .collect::<Result<Vec<_>>>()?,
            pagination: Pagination::new(total as u64, query.page, query.limit),
        })
    }

    async fn aggregate(&self, device_id: Option<&str>) -> Result<AlertAggregates> {
        let pool = &self.pool;
        let (total, unresolved, critical): (i64, i64, i64) =
            with_retry("alert summary", move || async move {
                sqlx::query_as(
                    "SELECT COUNT(*), \
                         COUNT(*) FILTER (WHERE NOT resolved), \
                         COUNT(*) FILTER (WHERE NOT resolved AND severity = 'critical') \
                     FROM alerts WHERE ($1::text IS NULL OR device_id = $1)",
                )
                .bind(device_id)
                .fetch_one(pool)
                .await
            })
            .await?;

        let by_type: Vec<(String, i64)> = with_retry("alert summary", move || async move {
            sqlx::query_as(
                "SELECT alert_type, COUNT(*) FROM alerts \
                 WHERE NOT resolved AND ($1::text IS NULL OR device_id = $1) \
                 GROUP BY alert_type ORDER BY COUNT(*) DESC, alert_type",
            )
            .bind(device_id)
            .fetch_all(pool)
            .await
        })
        .await?;

        let by_device: Vec<(String, i64)> = with_retry("alert summary", move || async move {
            sqlx::query_as(
                "SELECT device_id, COUNT(*) FROM alerts \
                 WHERE NOT resolved AND ($1::text IS NULL OR device_id = $1) \
                 GROUP BY device_id ORDER BY COUNT(*) DESC, device_id LIMIT $2",
            )
            .bind(device_id)
            .bind(TOP_DEVICES)
            .fetch_all(pool)
            .await
        })
        .await?;

        Ok(AlertAggregates {
            total: total as u64,
            unresolved: unresolved as u64,
            critical: critical as u64,
            by_type: by_type
                .into_iter()
                .map(|(t, count)| Ok((t.parse::<AlertType>()?, count as u64)))
                .collect::<Result<Vec<_>>>()?,
            by_device: by_device
                .into_iter()
                .map(|(d, count)| (d, count as u64))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;

    async fn live_store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        PgStore::connect(&url).await.unwrap()
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::PoolClosed));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_alert_filters_sql() {
        let query = AlertQuery {
            device_id: Some("dev-1".to_string()),
            resolved: ResolvedFilter::False,
            alert_type: Some(AlertType::LowBattery),
            limit: 10,
            page: 1,
            ..Default::default()
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM alerts");
        push_alert_filters(&mut qb, &query);
        assert_eq!(
            qb.sql(),
            "SELECT COUNT(*) FROM alerts WHERE TRUE AND device_id = $1 AND NOT resolved \
             AND alert_type = $2"
        );
    }

    #[test]
    fn test_alert_row_conversion() {
        let row = AlertRow {
            id: Uuid::new_v4(),
            device_id: "dev-1".to_string(),
            alert_type: "threshold_below".to_string(),
            severity: "critical".to_string(),
            message: "dry".to_string(),
            ts: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            telemetry_data: Json(serde_json::json!({"parameter": "moisture"})),
            notification_sent: false,
            notification_timestamp: None,
        };
        let alert = Alert::try_from(row).unwrap();
        assert_eq!(alert.alert_type, AlertType::ThresholdBelow);
        assert_eq!(alert.parameter(), Some("moisture"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_repeated_insert_reports_created() {
        let store = live_store().await;
        let candidate = Alert::from_new(NewAlert {
            device_id: format!("retry-{}", Uuid::new_v4()),
            alert_type: AlertType::LowBattery,
            severity: Severity::Warning,
            message: "battery low".to_string(),
            telemetry_data: serde_json::json!({}),
        });

        let first = store.insert_open_alert(&candidate).await.unwrap();
        let second = store.insert_open_alert(&candidate).await.unwrap();
        assert_eq!(first.map(|a| a.id), Some(candidate.id));
        assert_eq!(second.map(|a| a.id), Some(candidate.id));

        let mut rival = candidate.clone();
        rival.id = Uuid::new_v4();
        assert!(store.insert_open_alert(&rival).await.unwrap().is_none());
    }
}
