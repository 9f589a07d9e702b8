use std::{convert::Infallible, path::Path, sync::Arc};

use axum::{
    Form, Json, Router,
    body::Body,
    extract::{FromRequest, Multipart, Request, State},
    http::{
        HeaderMap, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    engine::{Engine, MediaKind, MediaMetadata, Quality},
    error::ApiError,
    files::FileManager,
};

pub const SERVICE_NAME: &str = "VidGet Backend API";
pub const SERVICE_VERSION: &str = "1.0";

const DEFAULT_STREAM_QUALITY: Quality = Quality::MaxHeight(480);
const DEFAULT_DOWNLOAD_QUALITY: Quality = Quality::Best;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn Engine>,
    pub files: Arc<FileManager>,
}

#[derive(Debug, Default, Deserialize)]
struct InfoForm {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamForm {
    url: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadForm {
    url: Option<String>,
    quality: Option<String>,
    format_type: Option<String>,
}

/// Fields of a urlencoded or multipart body. A body that is neither, or that
/// cannot be read, yields the empty default so validation reports what is
/// missing.
struct FormFields<T>(T);

impl<S, T> FromRequest<S> for FormFields<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default + Send,
{
    type Rejection = Infallible;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if is_multipart(&req) {
            return Ok(match Multipart::from_request(req, state).await {
                Ok(multipart) => Self(multipart_fields(multipart).await),
                Err(rejection) => {
                    debug!("Ignoring unreadable multipart body: {rejection}");
                    Self(T::default())
                }
            });
        }

        Ok(match Form::<T>::from_request(req, state).await {
            Ok(Form(fields)) => Self(fields),
            Err(rejection) => {
                debug!("Ignoring unreadable form body: {rejection}");
                Self(T::default())
            }
        })
    }
}

fn is_multipart(req: &Request) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("multipart/form-data")
        })
}

// Text parts only; the first value of a repeated name wins.
async fn multipart_fields<T: DeserializeOwned + Default>(mut multipart: Multipart) -> T {
    let mut fields = serde_json::Map::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(error) => {
                debug!("Could not read multipart field: {error}");
                break;
            }
        };

        let Some(name) = field.name().map(ToString::to_string) else {
            continue;
        };
        if field.file_name().is_some() {
            continue;
        }

        match field.text().await {
            Ok(value) => {
                fields
                    .entry(name)
                    .or_insert(serde_json::Value::String(value));
            }
            Err(error) => {
                debug!("Could not read multipart field {name}: {error}");
                break;
            }
        }
    }

    serde_json::from_value(serde_json::Value::Object(fields)).unwrap_or_default()
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    success: bool,
    #[serde(flatten)]
    metadata: MediaMetadata,
}

#[derive(Debug, Serialize)]
struct StreamUrlResponse {
    success: bool,
    stream_url: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/get-info", post(get_info))
        .route("/api/get-stream-url", post(get_stream_url))
        .route("/api/download", post(download))
        .with_state(state)
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION])
}

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "online",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "endpoints": {
            "info": "/api/get-info",
            "stream": "/api/get-stream-url",
            "download": "/api/download",
            "health": "/health",
        },
    }))
}

async fn health() -> Json<serde_json::Value> {
    let timestamp = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
    Json(serde_json::json!({ "status": "healthy", "timestamp": timestamp }))
}

async fn get_info(
    State(state): State<AppState>,
    FormFields(form): FormFields<InfoForm>,
) -> Result<Json<InfoResponse>, ApiError> {
    let url = require_url(form.url.as_deref())?;

    let metadata = state.engine.fetch_metadata(url).await?;
    Ok(Json(InfoResponse {
        success: true,
        metadata,
    }))
}

async fn get_stream_url(
    State(state): State<AppState>,
    FormFields(form): FormFields<StreamForm>,
) -> Result<Json<StreamUrlResponse>, ApiError> {
    let url = require_url(form.url.as_deref())?;
    let quality = parse_quality(form.quality.as_deref(), DEFAULT_STREAM_QUALITY)?;

    let stream_url = state.engine.resolve_stream_url(url, quality).await?;
    Ok(Json(StreamUrlResponse {
        success: true,
        stream_url,
    }))
}

async fn download(
    State(state): State<AppState>,
    FormFields(form): FormFields<DownloadForm>,
) -> Result<Response, ApiError> {
    let url = require_url(form.url.as_deref())?;
    let quality = parse_quality(form.quality.as_deref(), DEFAULT_DOWNLOAD_QUALITY)?;
    let kind = parse_kind(form.format_type.as_deref())?;

    let job = state.files.new_job(kind);
    let output_template = state.files.output_template(&job);

    let reported_path = match state
        .engine
        .download_and_transcode(url, kind, quality, &output_template)
        .await
    {
        Ok(path) => path,
        Err(error) => {
            state.files.discard(&job).await;
            return Err(error.into());
        }
    };

    let Some(path) = state.files.locate(&job.prefix()).await else {
        warn!(
            "Engine finished job {} but nothing named {} exists (engine reported {:?})",
            job.id,
            job.prefix(),
            reported_path
        );
        return Err(ApiError::download_missing());
    };

    // Deletion is scheduled before streaming so it never depends on the transfer.
    state.files.schedule_grace_delete(path.clone());

    let file = tokio::fs::File::open(&path).await.map_err(|error| {
        ApiError::internal(format!("Could not open downloaded file: {error}"))
    })?;
    let content_length = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("Could not read downloaded file: {error}")))?
        .len();

    info!(
        "Serving {} job {} ({} bytes) from {:?}",
        kind.as_str(),
        job.id,
        content_length,
        path
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_path(&path)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    let content_disposition = format!("attachment; filename=\"{}\"", kind.download_name());
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition)
            .map_err(|_| ApiError::internal("Could not build download header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

fn require_url(value: Option<&str>) -> Result<&str, ApiError> {
    let url = value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(ApiError::missing_url)?;
    Ok(url)
}

fn parse_quality(value: Option<&str>, default: Quality) -> Result<Quality, ApiError> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(default),
        Some(raw) => Quality::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("Invalid quality: {raw}"))),
    }
}

fn parse_kind(value: Option<&str>) -> Result<MediaKind, ApiError> {
    let raw = value.unwrap_or_default();
    MediaKind::parse(raw)
        .ok_or_else(|| ApiError::bad_request(format!("Invalid format_type: {}", raw.trim())))
}

fn content_type_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}
