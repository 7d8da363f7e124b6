//! HTTP trigger for the pipeline.
//!
//! Lets any external scheduler (cron + curl, a queue consumer, a person)
//! invoke a run and read back the tables.
//!
//! # API Endpoints
//!
//! | Method | Path                  | Description                          |
//! |--------|-----------------------|--------------------------------------|
//! | GET    | `/health`             | Health check                         |
//! | POST   | `/api/run`            | Process new data                     |
//! | GET    | `/api/manifest`       | Batch manifest (operational status)  |
//! | GET    | `/api/tables/{name}`  | bronze, silver, gold, quarantine     |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::types::{error_response, ManifestResponse, RunRequest, RunResponse, TableResponse};
use crate::error::{PipelineError, ServerError};
use crate::store::TableName;
use crate::transform::pipeline::{CancelFlag, Pipeline};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    /// One logical run at a time per process.
    run_lock: Arc<Mutex<()>>,
    cancel: CancelFlag,
}

impl AppState {
    pub fn new(pipeline: Pipeline, cancel: CancelFlag) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            run_lock: Arc::new(Mutex::new(())),
            cancel,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Busy(_) => StatusCode::CONFLICT,
            ServerError::Pipeline(PipelineError::StorageUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Pipeline(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(error_response(&self.to_string()))).into_response()
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/api/run", post(run))
        .route("/api/manifest", get(manifest))
        .route("/api/tables/{name}", get(table))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server. Ctrl-C cancels an in-flight run between stages.
pub async fn start_server(pipeline: Pipeline, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancelFlag::new();
    let app = router(AppState::new(pipeline, cancel.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    eprintln!("🚀 Refinery trigger listening on http://localhost:{}", port);
    eprintln!("   POST /api/run            - Process new data");
    eprintln!("   GET  /api/manifest       - Batch status");
    eprintln!("   GET  /api/tables/{{name}}  - Table contents");
    eprintln!("   GET  /health             - Health check");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested, cancelling runs");
            }
            cancel.cancel();
        })
        .await?;

    Ok(())
}

/// Health check endpoint
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "refinery",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn run(
    State(state): State<AppState>,
    body: Option<Json<RunRequest>>,
) -> Result<Json<RunResponse>, ServerError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let options = request.into_options().map_err(ServerError::BadRequest)?;

    let _running = state
        .run_lock
        .try_lock()
        .map_err(|_| ServerError::Busy("a run is already in progress".into()))?;

    let pipeline = state.pipeline.clone();
    let cancel = state.cancel.clone();
    let result = tokio::task::spawn_blocking(move || pipeline.run(&options, &cancel))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))??;

    Ok(Json(RunResponse::from(result)))
}

async fn manifest(State(state): State<AppState>) -> Result<Json<ManifestResponse>, ServerError> {
    let pipeline = state.pipeline.clone();
    let manifest = tokio::task::spawn_blocking(move || pipeline.status())
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))??;
    Ok(Json(ManifestResponse::from(manifest)))
}

async fn table(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<TableResponse>, ServerError> {
    let table: TableName = name.parse().map_err(ServerError::BadRequest)?;
    let pipeline = state.pipeline.clone();
    let rows = tokio::task::spawn_blocking(move || pipeline.table(table))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))??;
    Ok(Json(TableResponse::new(table.to_string(), rows)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[test]
    fn test_error_status_codes() {
        let bad = ServerError::BadRequest("nope".into()).into_response();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let outage = ServerError::Pipeline(PipelineError::StorageUnavailable(StorageError::unavailable(
            "silver/records.json",
            "timeout",
        )))
        .into_response();
        assert_eq!(outage.status(), StatusCode::SERVICE_UNAVAILABLE);

        let busy = ServerError::Busy("run".into()).into_response();
        assert_eq!(busy.status(), StatusCode::CONFLICT);

        let internal = ServerError::Internal("join".into()).into_response();
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
