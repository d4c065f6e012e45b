// Main entry point - Dependency injection and server setup
mod domain;
mod application;
mod infrastructure;
mod presentation;

use std::sync::Arc;
use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

use crate::application::pipeline::{PipelineService, PipelineSources};
use crate::application::report_service::ReportService;
use crate::application::session_service::SessionService;
use crate::infrastructure::config::load_settings;
use crate::infrastructure::source_loader::{load_optional, HttpOrFileSource};
use crate::infrastructure::xslt::XsltEngine;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{
    delete_session, export_csv, export_json, generate_config, get_raw, get_session, health_check,
    render_report, run_pipeline, stream_session, update_controls, view_xml,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let settings = load_settings().context("Failed to load settings")?;

    // Fetch reference documents (infrastructure layer)
    let source = HttpOrFileSource::new();
    let sources = PipelineSources {
        config_schema: load_optional(&source, "config schema", settings.sources.config_schema.as_deref()).await,
        sensor_schema: load_optional(&source, "sensor schema", settings.sources.sensor_schema.as_deref()).await,
        template: load_optional(&source, "template", settings.sources.template.as_deref()).await,
    };

    // Create services (application layer)
    let reports = ReportService::new(Arc::new(XsltEngine)).context("Failed to build report service")?;
    let pipeline = PipelineService::new(sources, reports);
    let sessions = SessionService::new(settings.engine.clone());

    // Create application state
    let state = Arc::new(AppState {
        pipeline,
        sessions: sessions.clone(),
    });

    // Build router (presentation layer)
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/pipeline", post(run_pipeline))
        .route("/report", post(render_report))
        .route("/config/generate", post(generate_config))
        .route("/xml/view", post(view_xml))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/raw", get(get_raw))
        .route("/sessions/:id/stream", get(stream_session))
        .route("/sessions/:id/controls", post(update_controls))
        .route("/sessions/:id/export.json", get(export_json))
        .route("/sessions/:id/export.csv", get(export_csv))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&settings.server.address)
        .await
        .with_context(|| format!("Failed to bind {}", settings.server.address))?;
    tracing::info!(address = %settings.server.address, "Starting iot-telemetry service");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Tear down live sessions
    sessions.stop_all().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
