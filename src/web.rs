//
// web.rs
// Dicom-Frames-rs
//
// Axum-based HTTP server exposing upload, study listing, frame rendering, and thumbnail APIs.
//
// Thales Matheus Mendonça Santos - November 2025

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::cache::CacheStats;
use crate::config::ServiceConfig;
use crate::error::RenderError;
use crate::models::{OutputFormat, StudyRecord, StudySummary};
use crate::registry::ConflictPolicy;
use crate::render::SizeHint;
use crate::service::{Ingested, RenderService};
use crate::window::WindowingMode;

const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    service: Arc<RenderService>,
}

type ApiResult<T> = Result<T, (StatusCode, Json<Value>)>;

/// Bootstraps the Axum HTTP server and wires up API routes.
pub async fn start_server(host: &str, port: u16, config: ServiceConfig) -> anyhow::Result<()> {
    let service = Arc::new(RenderService::new(config)?);
    let app = router(service);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(%addr, "server listening");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(service: Arc<RenderService>) -> Router {
    Router::new()
        .route("/api/upload", post(upload_handler))
        .route("/api/patients/:patient_id/studies", get(list_handler))
        .route("/api/assets/:asset_id", get(asset_handler))
        .route("/api/render/:patient_id/:filename", get(render_handler))
        .route("/api/thumbnail/:asset_id", get(thumbnail_handler))
        .route("/api/cache", get(cache_handler))
        .with_state(AppState { service })
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
}

async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Ingested>> {
    let mut original_name = None;
    let mut patient_id = None;
    let mut data = None;
    let mut policy = ConflictPolicy::Reject;

    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                original_name = field.file_name().map(|s| s.to_string());
                data = Some(field.bytes().await.map_err(bad_request)?);
            }
            Some("patient_id") => patient_id = Some(field.text().await.map_err(bad_request)?),
            Some("replace") => {
                if field.text().await.map_err(bad_request)?.trim() == "true" {
                    policy = ConflictPolicy::Replace;
                }
            }
            _ => {}
        }
    }

    let data = data.ok_or_else(|| bad_request("No file uploaded"))?;
    let patient_id = patient_id
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| bad_request("patient_id is required"))?;
    let original_name = original_name.unwrap_or_else(|| "upload.dcm".to_string());

    let ingested = state
        .service
        .ingest(data.to_vec(), &patient_id, &original_name, policy)
        .await
        .map_err(api_error)?;
    Ok(Json(ingested))
}

async fn list_handler(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> ApiResult<Json<Vec<StudySummary>>> {
    let studies = state
        .service
        .list_for_patient(&patient_id)
        .await
        .map_err(api_error)?;
    Ok(Json(studies))
}

async fn asset_handler(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> ApiResult<Json<StudyRecord>> {
    let record = state.service.lookup(&asset_id).await.map_err(api_error)?;
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
struct RenderQuery {
    frame: Option<u32>,
    enhancement: Option<String>,
    format: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

async fn render_handler(
    State(state): State<AppState>,
    Path((patient_id, filename)): Path<(String, String)>,
    Query(query): Query<RenderQuery>,
) -> ApiResult<impl IntoResponse> {
    let format: OutputFormat = query
        .format
        .as_deref()
        .unwrap_or("png")
        .parse()
        .map_err(bad_request)?;
    let mode: WindowingMode = query
        .enhancement
        .as_deref()
        .unwrap_or("none")
        .parse()
        .map_err(bad_request)?;
    let size = requested_size(&query, state.service.config().max_output_edge).map_err(bad_request)?;

    let frame = state
        .service
        .render_for_viewer(
            &patient_id,
            &filename,
            query.frame.unwrap_or(0),
            mode,
            format,
            size,
        )
        .await
        .map_err(api_error)?;

    let meta = frame.metadata;
    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static(frame.format.mime_type()),
        ),
        (HeaderName::from_static("x-frame-rows"), HeaderValue::from(meta.rows)),
        (HeaderName::from_static("x-frame-columns"), HeaderValue::from(meta.columns)),
        (
            HeaderName::from_static("x-frame-bits-allocated"),
            HeaderValue::from(meta.bits_allocated),
        ),
        (HeaderName::from_static("x-frame-count"), HeaderValue::from(meta.frame_count)),
        (
            HeaderName::from_static("x-frame-extracted"),
            HeaderValue::from(meta.extracted_frame),
        ),
        (
            HeaderName::from_static("x-asset-id"),
            HeaderValue::from_str(&frame.asset_id).map_err(internal_error)?,
        ),
    ];
    Ok((headers, frame.image_bytes))
}

fn requested_size(query: &RenderQuery, max_edge: u32) -> Result<SizeHint, String> {
    for (name, value) in [("width", query.width), ("height", query.height)] {
        if let Some(value) = value.filter(|v| *v > max_edge) {
            return Err(format!("{} {} exceeds the {} pixel limit", name, value, max_edge));
        }
    }
    Ok(SizeHint {
        width: query.width,
        height: query.height,
    })
}

async fn thumbnail_handler(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let rendered = state.service.thumbnail(&asset_id).await.map_err(api_error)?;
    Ok((
        [(header::CONTENT_TYPE, rendered.format.mime_type())],
        rendered.bytes,
    ))
}

async fn cache_handler(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.service.cache().stats())
}

fn status_for(err: &RenderError) -> StatusCode {
    match err {
        RenderError::NotFound(_) => StatusCode::NOT_FOUND,
        RenderError::FrameIndexOutOfBounds { .. } => StatusCode::BAD_REQUEST,
        RenderError::UnsupportedEncoding { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        RenderError::RegistryConflict { .. } => StatusCode::CONFLICT,
        RenderError::UnreadableAsset(_) | RenderError::DegenerateWindow(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        RenderError::EncodingFailure(_)
        | RenderError::TaskFailed(_)
        | RenderError::Storage(_)
        | RenderError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: RenderError) -> (StatusCode, Json<Value>) {
    (
        status_for(&err),
        Json(json!({ "error": err.kind(), "message": err.to_string() })),
    )
}

fn bad_request<E: ToString>(err: E) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "BadRequest", "message": err.to_string() })),
    )
}

fn internal_error<E: ToString>(err: E) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal", "message": err.to_string() })),
    )
}
