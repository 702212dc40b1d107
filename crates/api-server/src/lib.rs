//! HTTP surface for the Forensics Shadow Pipeline.
//!
//! Thin axum layer over the orchestrator and blackboard: request decoding,
//! the uniform response envelope, and the error-to-status mapping live
//! here; everything analytic lives in the engine crates.

pub mod forensics_routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use blackboard::{BackingStore, Blackboard, MemoryBackingStore, RedisBackingStore};
use forensics_core::{ForensicsConfig, ForensicsError};
use forensics_orchestrator::ForensicsPipeline;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ForensicsPipeline>,
}

impl AppState {
    pub fn board(&self) -> &Arc<Blackboard> {
        self.pipeline.blackboard()
    }
}

/// Uniform response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Error wrapper mapping the pipeline taxonomy onto HTTP statuses.
#[derive(Debug)]
pub struct AppError(pub ForensicsError);

impl From<ForensicsError> for AppError {
    fn from(err: ForensicsError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ForensicsError::EmptyBatch | ForensicsError::InvalidArgument(_) => {
                StatusCode::BAD_REQUEST
            }
            ForensicsError::NotFound(_) => StatusCode::NOT_FOUND,
            ForensicsError::WorkerUnavailable(_)
            | ForensicsError::PhaseFailure { .. }
            | ForensicsError::BlackboardUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ApiResponse::failure(self.0.to_string()));
        (status, body).into_response()
    }
}

/// Build the full application router for a pipeline instance.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(forensics_routes::forensics_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Entry point for the api-server binary: env config, tracing, store
/// selection, serve.
pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ForensicsConfig::default();

    let store: Arc<dyn BackingStore> = match &config.redis_url {
        Some(url) => match RedisBackingStore::connect(url).await {
            Ok(store) => {
                tracing::info!(%url, "blackboard backed by redis");
                Arc::new(store)
            }
            Err(e) => {
                tracing::warn!(%url, error = %e, "redis unavailable; using in-memory store");
                Arc::new(MemoryBackingStore::new())
            }
        },
        None => {
            tracing::info!("no redis configured; using in-memory store");
            Arc::new(MemoryBackingStore::new())
        }
    };

    let board = Arc::new(Blackboard::new(config.environment_prefix.clone(), store));
    let pipeline = Arc::new(ForensicsPipeline::new(config.clone(), board));
    let router = app(AppState { pipeline });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "forensics api-server listening");
    axum::serve(listener, router).await?;
    Ok(())
}
