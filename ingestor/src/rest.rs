use crate::commands::CommandDispatcher;
use crate::errors::Error;
use crate::model::{
    Alert, AlertPage, AlertQuery, AlertSummary, ResolvedFilter, TelemetryQuery, TelemetryResponse,
};
use crate::query::{AlertService, DEFAULT_LIMIT, MAX_LIMIT};
use crate::store::TelemetryStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub alerts: Arc<AlertService>,
    pub telemetry: Arc<dyn TelemetryStore>,
    pub commands: Arc<CommandDispatcher>,
}

#[derive(Debug, Deserialize)]
pub struct AlertParams {
    device_id: Option<String>,
    resolved: Option<String>,
    severity: Option<String>,
    #[serde(rename = "type")]
    alert_type: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    page: Option<usize>,
}

impl AlertParams {
    fn into_query(self) -> Result<AlertQuery, Error> {
        Ok(AlertQuery {
            device_id: self.device_id,
            resolved: parse_opt::<ResolvedFilter>(self.resolved)?.unwrap_or_default(),
            severity: parse_opt(self.severity)?,
            alert_type: parse_opt(self.alert_type)?,
            start: self.start,
            end: self.end,
            limit: self.limit.unwrap_or(DEFAULT_LIMIT),
            page: self.page.unwrap_or(1),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelemetryParams {
    device_id: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    user_id: String,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    command: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct CommandResult {
    sent: bool,
}

#[derive(Debug, Serialize)]
pub struct Connectivity {
    device_id: String,
    online: bool,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/alerts", get(get_alerts))
        .route("/api/v1/alerts/summary", get(get_alerts_summary))
        .route("/api/v1/alerts/:id", get(get_alert).delete(delete_alert))
        .route("/api/v1/alerts/:id/resolve", post(resolve_alert))
        .route("/api/v1/telemetry", get(get_telemetry))
        .route("/api/v1/devices/:id/commands", post(send_command))
        .route("/api/v1/devices/:id/connectivity", get(check_connectivity))
        .with_state(state)
}

async fn get_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertParams>,
) -> Result<Json<AlertPage>, AppError> {
    let page = state.alerts.get_alerts(params.into_query()?).await?;
    Ok(Json(page))
}

async fn get_alerts_summary(
    State(state): State<AppState>,
    Query(params): Query<SummaryParams>,
) -> Result<Json<AlertSummary>, AppError> {
    let summary = state
        .alerts
        .get_alerts_summary(params.device_id.as_deref())
        .await?;
    Ok(Json(summary))
}

async fn get_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Alert>, AppError> {
    Ok(Json(state.alerts.get_alert(parse_id(&id)?).await?))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResolveRequest>,
) -> Result<Json<Alert>, AppError> {
    if body.user_id.trim().is_empty() {
        return Err(Error::Validation("user_id must not be empty".to_string()).into());
    }
    let alert = state
        .alerts
        .resolve_alert(parse_id(&id)?, &body.user_id, body.notes)
        .await?;
    Ok(Json(alert))
}

async fn delete_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.alerts.delete_alert(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_telemetry(
    State(state): State<AppState>,
    Query(params): Query<TelemetryParams>,
) -> Result<Json<TelemetryResponse>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = params.offset.unwrap_or(0);

    let data = state
        .telemetry
        .query(&TelemetryQuery {
            device_id: params.device_id,
            start: params.start,
            end: params.end,
            limit,
            offset,
        })
        .await?;

    Ok(Json(TelemetryResponse {
        total: data.len(),
        data,
        limit,
        offset,
    }))
}

async fn send_command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<CommandRequest>,
) -> Json<CommandResult> {
    let data = body.data.unwrap_or_else(|| json!({}));
    let sent = state
        .commands
        .send_command(&device_id, &body.command, data)
        .await;
    Json(CommandResult { sent })
}

async fn check_connectivity(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Json<Connectivity> {
    let online = state.commands.check_device_connectivity(&device_id).await;
    Json(Connectivity { device_id, online })
}

fn parse_id(id: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(id).map_err(|_| Error::Validation(format!("Invalid alert id: {}", id)))
}

fn parse_opt<T>(value: Option<String>) -> Result<Option<T>, Error>
where
    T: FromStr<Err = Error>,
{
    value.as_deref().map(str::parse).transpose()
}

pub struct AppError(anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<Error>() {
            Some(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            Some(Error::Validation(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let not_found: AppError = Error::AlertNotFound("x".to_string()).into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let missing_device: AppError = Error::DeviceNotFound("d".to_string()).into();
        assert_eq!(missing_device.status(), StatusCode::NOT_FOUND);

        let invalid: AppError = Error::Validation("bad".to_string()).into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let other: AppError = anyhow::anyhow!("boom").into();
        assert_eq!(other.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_alert_params_parse_filters() {
        let params = AlertParams {
            device_id: Some("d1".to_string()),
            resolved: Some("false".to_string()),
            severity: Some("critical".to_string()),
            alert_type: Some("low_battery".to_string()),
            start: None,
            end: None,
            limit: None,
            page: None,
        };
        let query = params.into_query().unwrap();
        assert_eq!(query.resolved, ResolvedFilter::False);
        assert_eq!(query.limit, DEFAULT_LIMIT);
        assert_eq!(query.page, 1);
        assert_eq!(query.severity.map(|s| s.as_str()), Some("critical"));
        assert_eq!(query.alert_type.map(|t| t.as_str()), Some("low_battery"));
    }

    #[test]
    fn test_alert_params_reject_unknown_values() {
        let params = AlertParams {
            device_id: None,
            resolved: Some("maybe".to_string()),
            severity: None,
            alert_type: None,
            start: None,
            end: None,
            limit: None,
            page: None,
        };
        assert!(matches!(params.into_query(), Err(Error::Validation(_))));
    }
}
