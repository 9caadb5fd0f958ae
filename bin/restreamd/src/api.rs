use std::{path::PathBuf, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use restream::{ChannelRegistry, RestreamError, SegmentSource};
use serde_json::json;

use crate::playlist;

pub struct App<S> {
    pub registry: ChannelRegistry<S>,
    pub playlist: PathBuf,
    pub autostart: bool,
}

pub fn router<S: SegmentSource>(app: Arc<App<S>>) -> Router {
    Router::new()
        .route("/api/channels", get(list_channels::<S>))
        .route("/api/channels/{id}/start", post(start_channel::<S>))
        .route("/api/channels/{id}/stop", post(stop_channel::<S>))
        .route("/api/channels/{id}/restart", post(restart_channel::<S>))
        .route("/api/channels/{id}/status", get(channel_status::<S>))
        .route("/api/stats", get(stats::<S>))
        .route("/api/reload", post(reload::<S>))
        .route("/stream/{id}", get(stream::<S>))
        .with_state(app)
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Restream(#[from] RestreamError),

    #[error("playlist error: {0}")]
    Playlist(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Restream(RestreamError::ChannelNotFound(_)) => {
                (StatusCode::NOT_FOUND, "channel not found".to_string())
            }
            ApiError::Restream(RestreamError::ChannelNotRunning(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "channel not running".to_string())
            }
            e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn list_channels<S: SegmentSource>(State(app): State<Arc<App<S>>>) -> impl IntoResponse {
    Json(app.registry.list_all())
}

async fn start_channel<S: SegmentSource>(
    State(app): State<Arc<App<S>>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let status = app.registry.start(&id)?;
    Ok(Json(json!({ "status": "started", "channel_id": id, "channel": status })))
}

async fn stop_channel<S: SegmentSource>(
    State(app): State<Arc<App<S>>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let status = app.registry.stop(&id).await?;
    Ok(Json(json!({ "status": "stopped", "channel_id": id, "channel": status })))
}

async fn restart_channel<S: SegmentSource>(
    State(app): State<Arc<App<S>>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let status = app.registry.restart(&id).await?;
    Ok(Json(json!({ "status": "restarted", "channel_id": id, "channel": status })))
}

async fn channel_status<S: SegmentSource>(
    State(app): State<Arc<App<S>>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.registry.status(&id)?))
}

async fn stats<S: SegmentSource>(State(app): State<Arc<App<S>>>) -> impl IntoResponse {
    Json(app.registry.stats())
}

async fn reload<S: SegmentSource>(State(app): State<Arc<App<S>>>) -> ApiResult<impl IntoResponse> {
    let channels = playlist::load(&app.playlist).await?;
    let loaded = channels.len();
    let summary = app.registry.reload(channels, app.autostart).await;
    Ok(Json(json!({ "loaded": loaded, "summary": summary })))
}

async fn stream<S: SegmentSource>(
    State(app): State<Arc<App<S>>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let worker = app.registry.worker(&id)?;
    let reader = worker.open_reader()?;
    tracing::info!(channel = %id, clients = worker.buffer().readers(), "Viewer connected");

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store"),
    );
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert(HeaderName::from_static("x-channel-id"), value);
    }
    if let Ok(value) = HeaderValue::from_bytes(worker.config().name.as_bytes()) {
        headers.insert(HeaderName::from_static("x-channel-name"), value);
    }

    let body = reader.into_stream().inspect_err(move |e| {
        tracing::info!(channel = %id, "Viewer dropped: {e}");
    });
    Ok((headers, Body::from_stream(body)).into_response())
}
