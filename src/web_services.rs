use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use log::{error, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

use crate::mail_reader::imap::{list_mailbox_folders, Credentials, ImapSession};
use crate::mail_reader::summary::SummaryOptions;
use crate::mail_reader::MailReader;
use crate::settings::Config;

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        AppError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn failed(context: &str, err: impl fmt::Display) -> Self {
        error!("{}: {}", context, err);
        AppError::bad_request(format!("{}: {}", context, err))
    }
}

impl std::error::Error for AppError {}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::bad_request(format!("Petición no válida: {}", rejection.body_text()))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub struct AppState {
    pub config: Config,
    pub reader: MailReader,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsRequest {
    email: Option<String>,
    app_password: Option<String>,
}

impl CredentialsRequest {
    fn credentials(&self) -> Result<Credentials, AppError> {
        match (self.email.as_deref(), self.app_password.as_deref()) {
            (Some(email), Some(app_password)) if !email.is_empty() && !app_password.is_empty() => {
                Ok(Credentials {
                    email: email.to_string(),
                    app_password: app_password.to_string(),
                })
            }
            _ => Err(AppError::bad_request("Email y appPassword son requeridos")),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchRequest {
    #[serde(flatten)]
    credentials: CredentialsRequest,
    limit: Option<usize>,
    received_after: Option<String>,
    received_before: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchAttachmentsRequest {
    #[serde(flatten)]
    credentials: CredentialsRequest,
    message_uids: Option<Vec<String>>,
}

/// Accepts `YYYY-MM-DD` or a full RFC 3339 timestamp, keeping only its date.
fn parse_request_date(field: &str, value: Option<&str>) -> Result<Option<NaiveDate>, AppError> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|d| d.date_naive()))
        .map(Some)
        .map_err(|_| AppError::bad_request(format!("{} no es una fecha válida: {}", field, value)))
}

fn summary_options(request: &FetchRequest, default_limit: usize) -> Result<SummaryOptions, AppError> {
    Ok(SummaryOptions {
        limit: request.limit.unwrap_or(default_limit),
        received_after: parse_request_date("receivedAfter", request.received_after.as_deref())?,
        received_before: parse_request_date("receivedBefore", request.received_before.as_deref())?,
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

async fn folders(state: &AppState, request: &CredentialsRequest, context: &str) -> Result<Vec<String>, AppError> {
    let credentials = request.credentials()?;
    list_mailbox_folders(&state.config.imap, &credentials)
        .await
        .map_err(|e| AppError::failed(context, e))
}

async fn test_connection(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = payload?;
    let folders = folders(&state, &request, "Error de IMAP").await?;
    Ok(Json(json!({
        "connected": true,
        "folders": folders,
        "message": "Conexión verificada correctamente",
    })))
}

async fn connect(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = payload?;
    let folders = folders(&state, &request, "Error de conexión").await?;
    Ok(Json(json!({
        "success": true,
        "email": request.email,
        "connected": true,
        "folders": folders,
        "message": "Conexión IMAP exitosa",
    })))
}

async fn fetch_emails(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<FetchRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = payload?;
    let credentials = request.credentials.credentials()?;
    let options = summary_options(&request, state.config.fetch.default_limit)?;
    info!("Fetching emails for {} {:?}", credentials.email, options);

    let session = ImapSession::open(&state.config.imap, &credentials, state.config.fetch.preview_bytes)
        .await
        .map_err(|e| AppError::failed("Error al obtener emails", e))?;
    let emails = state
        .reader
        .list_summaries(session, &options)
        .await
        .map_err(|e| AppError::failed("Error al obtener emails", e))?;

    Ok(Json(json!({
        "success": true,
        "count": emails.len(),
        "emails": emails,
    })))
}

async fn fetch_attachments(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<FetchAttachmentsRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = payload?;
    let credentials = request.credentials.credentials()?;
    let Some(message_uids) = request.message_uids else {
        return Err(AppError::bad_request("Email, appPassword y messageUids son requeridos"));
    };
    info!("Fetching attachments for {} messages", message_uids.len());

    let session = ImapSession::open(&state.config.imap, &credentials, state.config.fetch.preview_bytes)
        .await
        .map_err(|e| AppError::failed("Error al obtener adjuntos", e))?;
    let attachments = state
        .reader
        .fetch_attachments(session, &message_uids)
        .await
        .map_err(|e| AppError::failed("Error al obtener adjuntos", e))?;

    Ok(Json(json!({
        "success": true,
        "count": attachments.len(),
        "attachments": attachments,
    })))
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/test", post(test_connection))
        .route("/connect", post(connect))
        .route("/fetch", post(fetch_emails))
        .route("/fetch-attachments", post(fetch_attachments))
        .with_state(state)
}

pub async fn entrypoint(config: Config) -> anyhow::Result<()> {
    let reader = MailReader::from_config(&config)?;
    let address = (config.server.host.clone(), config.server.port);
    let router = create_router(Arc::new(AppState { config, reader }));

    let listener = tokio::net::TcpListener::bind(address.clone()).await?;
    info!("Server running on http://{}:{}", address.0, address.1);
    info!("Health check: http://{}:{}/health", address.0, address.1);
    axum::serve(listener, router).await?;
    Ok(())
}
