// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Coffer HTTP API
//!
//! An axum service where every data request runs inside one Coffer
//! transaction: the connection opens on first access to the root mapping
//! and is committed or aborted when the response is ready.

pub mod metrics;
pub mod scope;

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use coffer_db::{ActivityReport, DbError, TransferCounts, STORAGE_CONFIG_KEY};
use coffer_request::{AppConfig, Application, Coffer, RequestError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, instrument};

pub use metrics::ApiMetrics;
pub use scope::{request_scope, RequestScope};

/// API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Another request committed a conflicting write first.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RequestError> for ApiError {
    fn from(e: RequestError) -> Self {
        if e.is_conflict() {
            return Self::Conflict(e.to_string());
        }
        match &e {
            RequestError::Db(DbError::Storage(s)) if s.is_unavailable() => {
                Self::Unavailable(e.to_string())
            }
            RequestError::Db(DbError::Serialization { .. }) => Self::Serialization(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        RequestError::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_)
            | ApiError::Serialization(_)
            | ApiError::Metrics(_)
            | ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Storage URI the connection pool is built from
    pub storage: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            storage: "memory://coffer".to_string(),
        }
    }
}

impl ApiConfig {
    /// Apply `COFFER_STORAGE` from the environment, if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(storage) = std::env::var(STORAGE_CONFIG_KEY) {
            if !storage.trim().is_empty() {
                self.storage = storage;
            }
        }
        self
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeysResponse {
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntryResponse {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct WriteParams {
    /// Abort the request's transaction after the write.
    #[serde(default)]
    pub doom: bool,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub key: String,
    pub doomed: bool,
    /// Transfer counts of the request's connection after the write.
    pub transfers: TransferCounts,
}

/// Pool statistics
#[derive(Debug, Serialize)]
pub struct PoolResponse {
    pub database_name: String,
    pub storage: String,
    pub pool_size: usize,
    pub open_connections: usize,
    pub idle_connections: usize,
    pub last_transaction: u64,
    pub activity: Option<ActivityReport>,
}

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub app: Arc<Application>,
    pub metrics: ApiMetrics,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build the host application for `config` and bind Coffer to it.
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let metrics = ApiMetrics::new()?;
        let mut app = Application::with_config(
            "coffer-api",
            AppConfig::with_storage(config.storage.as_str()),
        );
        let coffer = Coffer::with_app(&mut app)?;
        let opened = metrics.clone();
        coffer.on_connection_opened(move || opened.connection_opened());

        Ok(Self {
            app: Arc::new(app),
            metrics,
            start_time: std::time::Instant::now(),
        })
    }
}

/// Build the API router
pub fn build_router(state: AppState) -> Router {
    let data = Router::new()
        .route("/root", get(list_keys_handler))
        .route(
            "/root/{key}",
            get(get_entry_handler)
                .put(put_entry_handler)
                .delete(delete_entry_handler),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), request_scope));

    Router::new()
        .route("/health", get(health_handler))
        .route("/pool", get(pool_handler))
        .route("/metrics", get(metrics_handler))
        .merge(data)
        .with_state(state)
}

#[instrument(skip(state))]
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

#[instrument(skip(scope))]
async fn list_keys_handler(
    Extension(scope): Extension<RequestScope>,
) -> Result<Json<KeysResponse>, ApiError> {
    let mut ctx = scope.lock().await;
    let keys = ctx.data().await?.keys().await?;
    Ok(Json(KeysResponse { keys }))
}

#[instrument(skip(scope))]
async fn get_entry_handler(
    Extension(scope): Extension<RequestScope>,
    Path(key): Path<String>,
) -> Result<Json<EntryResponse>, ApiError> {
    let mut ctx = scope.lock().await;
    let value = ctx
        .data()
        .await?
        .get_value(&key)
        .await?
        .ok_or_else(|| ApiError::NotFound(key.clone()))?;
    Ok(Json(EntryResponse { key, value }))
}

#[instrument(skip(scope, value))]
async fn put_entry_handler(
    Extension(scope): Extension<RequestScope>,
    Path(key): Path<String>,
    Query(params): Query<WriteParams>,
    Json(value): Json<Value>,
) -> Result<Json<WriteResponse>, ApiError> {
    if key.is_empty() {
        return Err(ApiError::BadRequest("empty key".to_string()));
    }
    let mut ctx = scope.lock().await;
    ctx.data().await?.insert_value(&key, value)?;
    if params.doom {
        ctx.doom()?;
    }
    Ok(Json(WriteResponse {
        key,
        doomed: ctx.is_doomed(),
        transfers: ctx.transfers()?,
    }))
}

#[instrument(skip(scope))]
async fn delete_entry_handler(
    Extension(scope): Extension<RequestScope>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let mut ctx = scope.lock().await;
    if ctx.data().await?.remove(&key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(key))
    }
}

#[instrument(skip(state))]
async fn pool_handler(State(state): State<AppState>) -> Result<Json<PoolResponse>, ApiError> {
    let db = state.app.database().await?;
    let activity = db.activity_monitor().map(|m| m.activity(None, None, 10));
    Ok(Json(PoolResponse {
        database_name: db.database_name().to_string(),
        storage: db.storage_name().to_string(),
        pool_size: db.pool_size(),
        open_connections: db.open_connections(),
        idle_connections: db.idle_connections(),
        last_transaction: db.last_transaction(),
        activity,
    }))
}

#[instrument(skip(state))]
async fn metrics_handler(State(state): State<AppState>) -> Result<String, ApiError> {
    let open = state
        .app
        .extension(coffer_request::EXTENSION_KEY)
        .and_then(|s| s.built_database())
        .map_or(0, |db| db.open_connections());
    state.metrics.set_open_connections(open);
    state.metrics.render()
}

/// Start the API server
pub async fn serve(config: ApiConfig) -> Result<(), ApiError> {
    let state = AppState::new(&config)?;
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!(addr = %addr, storage = %config.storage, "Starting Coffer API server");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
