//! HTTP server for the microcdn endpoints
//!
//! Provides /health, /meta/{file_id}, and GET/PUT/DELETE on /{file_id}, plus
//! POST / for new uploads.

use crate::compiler::{check_password, CompilePipeline};
use crate::error::AppError;
use crate::fetcher::FetchOrchestrator;
use crate::headers::{
    accepts_brotli, candidate_password, collect_metadata, if_modified_since, response_headers,
};
use crate::streams::decompress;
use crate::types::{DeletedResponse, HealthResponse};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use script_storage::{is_map_id, ByteStream, ReadOutcome, StorageEngine};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for the HTTP server
pub struct ServerState {
    pub storage: Arc<StorageEngine>,
    pub fetcher: FetchOrchestrator,
    pub pipeline: CompilePipeline,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(
        storage: Arc<StorageEngine>,
        fetcher: FetchOrchestrator,
        pipeline: CompilePipeline,
    ) -> Self {
        Self {
            storage,
            fetcher,
            pipeline,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/", axum::routing::post(upload))
        .route("/meta/{file_id}", get(get_meta))
        .route(
            "/{file_id}",
            get(get_file).put(patch_file).delete(delete_file),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let cache = state
        .fetcher
        .cache()
        .map(|cache| cache.stats())
        .unwrap_or_default();
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache,
    })
}

fn request_stream(body: Body) -> ByteStream {
    body.into_data_stream().map_err(std::io::Error::other).boxed()
}

/// Declared upload type; a generic binary type counts as undeclared
fn declared_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|mime| !mime.starts_with("application/octet-stream"))
}

/// Stream an object back, brotli encoded when the caller accepts it
async fn serve(
    state: &ServerState,
    id: &str,
    since: Option<i64>,
    request: &HeaderMap,
) -> Result<Response, AppError> {
    let compressed = accepts_brotli(request);
    let stream = match state.fetcher.get_read_stream(id, since, !compressed).await? {
        ReadOutcome::Stream(stream) => stream,
        ReadOutcome::NotModified => return Ok(StatusCode::NOT_MODIFIED.into_response()),
        ReadOutcome::NotFound => return Err(AppError::NotFound(id.to_string())),
    };

    // Maps are always read raw
    let stream = if is_map_id(id) && !compressed {
        stream.map_body(decompress)
    } else {
        stream
    };

    let metadata = match stream.metadata {
        Some(metadata) => Some(metadata),
        None => state.fetcher.get_metadata(id).await?,
    };
    let headers = response_headers(&stream.id, metadata.as_ref(), compressed);
    Ok((StatusCode::OK, headers, Body::from_stream(stream.body)).into_response())
}

async fn get_file(
    State(state): State<SharedState>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve(&state, &file_id, if_modified_since(&headers), &headers).await
}

async fn get_meta(
    State(state): State<SharedState>,
    Path(file_id): Path<String>,
) -> Result<Response, AppError> {
    match state.fetcher.get_metadata(&file_id).await? {
        Some(metadata) => Ok(Json(metadata.public_view()).into_response()),
        None => Err(AppError::NotFound(file_id)),
    }
}

async fn upload(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let id = state
        .pipeline
        .ingest_new(
            request_stream(body),
            declared_type(&headers),
            collect_metadata(&headers),
        )
        .await?;
    serve(&state, &id, None, &headers).await
}

async fn patch_file(
    State(state): State<SharedState>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let id = state
        .pipeline
        .patch(
            request_stream(body),
            declared_type(&headers),
            collect_metadata(&headers),
            &file_id,
            candidate_password(&headers),
        )
        .await?;
    serve(&state, &id, None, &headers).await
}

async fn delete_file(
    State(state): State<SharedState>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeletedResponse>, AppError> {
    let metadata = state
        .storage
        .get_metadata(&file_id)
        .await?
        .ok_or_else(|| AppError::NotFound(file_id.clone()))?;
    check_password(&metadata, candidate_password(&headers))?;

    state.storage.delete_object(&file_id).await;
    Ok(Json(DeletedResponse {
        id: file_id,
        deleted: true,
    }))
}
