// HTTP request handlers
use crate::application::config_generator::generate_config_xml;
use crate::application::live_engine::Control;
use crate::domain::dashboard::DashboardView;
use crate::domain::device::DeviceConfigForm;
use crate::domain::error::PipelineError;
use crate::domain::telemetry::DashboardState;
use crate::infrastructure::export::{content_disposition, download_filename, to_csv, to_json};
use crate::infrastructure::xml_format::{prettify, viewer_filename};
use crate::presentation::app_state::AppState;
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    SessionNotFound(Uuid),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Pipeline(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({ "alerts": err.alerts() })),
            )
                .into_response(),
            Self::SessionNotFound(id) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": format!("Unknown session {id}") })),
            )
                .into_response(),
            Self::Internal(message) => {
                tracing::error!(error = %message, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": message })),
                )
                    .into_response()
            }
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self::Pipeline(err)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    pub config_xml: String,
    pub sensor_xml: String,
    pub push_address: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResponse {
    pub session_id: Uuid,
    pub alerts: Vec<String>,
    pub dashboard: DashboardState,
    pub report: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub config_xml: Option<String>,
    pub sensor_xml: Option<String>,
}

#[derive(Deserialize)]
pub struct ViewerRequest {
    pub xml: String,
    pub title: Option<String>,
    #[serde(default = "default_pretty")]
    pub pretty: bool,
}

fn default_pretty() -> bool {
    true
}

#[derive(Deserialize, Default)]
pub struct ControlRequest {
    pub paused: Option<bool>,
    pub speed: Option<f64>,
    pub visible: Option<bool>,
}

impl ControlRequest {
    fn into_controls(self) -> Vec<Control> {
        let mut controls = Vec::new();
        if let Some(paused) = self.paused {
            controls.push(Control::Pause(paused));
        }
        if let Some(speed) = self.speed {
            controls.push(Control::Speed(speed));
        }
        if let Some(visible) = self.visible {
            controls.push(Control::Visible(visible));
        }
        controls
    }
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Run the pipeline and start a live session on the analyzed state
pub async fn run_pipeline(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PipelineRequest>,
) -> Result<Json<PipelineResponse>, ApiError> {
    // Parsing and the transform are CPU-bound
    let pipeline = state.pipeline.clone();
    let (config_xml, sensor_xml) = (request.config_xml, request.sensor_xml);
    let outcome = tokio::task::spawn_blocking(move || pipeline.run(&config_xml, &sensor_xml))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    let session_id = state
        .sessions
        .start(outcome.dashboard.clone(), request.push_address.as_deref())
        .await;

    Ok(Json(PipelineResponse {
        session_id,
        alerts: outcome.alerts,
        dashboard: outcome.dashboard,
        report: outcome.report,
    }))
}

/// Render the report for validated documents; violations map to 422
pub async fn render_report(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReportRequest>,
) -> Result<Html<String>, ApiError> {
    let pipeline = state.pipeline.clone();
    let html = tokio::task::spawn_blocking(move || {
        pipeline.report(request.config_xml.as_deref(), request.sensor_xml.as_deref())
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Html(html))
}

/// Pretty-printed (or raw) XML as a download
pub async fn view_xml(Json(request): Json<ViewerRequest>) -> Response {
    let body = if request.pretty {
        prettify(&request.xml)
    } else {
        request.xml
    };
    let filename = viewer_filename(request.title.as_deref());
    (
        [
            (header::CONTENT_TYPE, "application/xml; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(&filename)),
        ],
        body,
    )
        .into_response()
}

pub async fn get_session(
    Path(id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<DashboardView>, ApiError> {
    let snapshot = state.sessions.snapshot(id).await.ok_or(ApiError::SessionNotFound(id))?;
    Ok(Json(snapshot.view.clone()))
}

pub async fn get_raw(
    Path(id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<DashboardState>, ApiError> {
    let snapshot = state.sessions.snapshot(id).await.ok_or(ApiError::SessionNotFound(id))?;
    Ok(Json(snapshot.raw.clone()))
}

/// Stream displayed snapshots as Server-Sent Events until the session stops
pub async fn stream_session(
    Path(id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut rx = state.sessions.subscribe(id).await.ok_or(ApiError::SessionNotFound(id))?;

    let stream = async_stream::stream! {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            match Event::default().json_data(&snapshot.view) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to encode snapshot"),
            }
            if snapshot.stopped || rx.changed().await.is_err() {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn update_controls(
    Path(id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<ControlRequest>,
) -> Result<StatusCode, ApiError> {
    for control in request.into_controls() {
        if !state.sessions.control(id, control).await {
            return Err(ApiError::SessionNotFound(id));
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn export_json(
    Path(id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let snapshot = state.sessions.snapshot(id).await.ok_or(ApiError::SessionNotFound(id))?;
    let body = to_json(&snapshot.raw).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(attachment(&snapshot.raw.device_id, "json", "application/json", body))
}

pub async fn export_csv(
    Path(id): Path<Uuid>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let snapshot = state.sessions.snapshot(id).await.ok_or(ApiError::SessionNotFound(id))?;
    Ok(attachment(&snapshot.raw.device_id, "csv", "text/csv; charset=utf-8", to_csv(&snapshot.raw)))
}

fn attachment(device_id: &str, extension: &str, content_type: &'static str, body: String) -> Response {
    let filename = download_filename(device_id, extension);
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(&filename)),
        ],
        body,
    )
        .into_response()
}

/// Tear a session down. Unknown ids are fine: teardown is idempotent.
pub async fn delete_session(Path(id): Path<Uuid>, State(state): State<Arc<AppState>>) -> StatusCode {
    state.sessions.stop(id).await;
    StatusCode::NO_CONTENT
}

pub async fn generate_config(Json(form): Json<DeviceConfigForm>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        generate_config_xml(&form),
    )
}
