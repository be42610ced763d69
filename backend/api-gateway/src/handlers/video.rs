use std::collections::HashMap;

use actix_multipart::Multipart;
use actix_web::http::header::{ContentDisposition, CONTENT_DISPOSITION, CONTENT_TYPE};
use actix_web::http::StatusCode;
use actix_web::{get, post, web, HttpRequest, HttpResponse, ResponseError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use chrono::Utc;
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::error::AppError;
use crate::metrics::{self, ingress};
use crate::proto::video::{StartStreamRequest, StopStreamRequest, VideoFrame};
use crate::services::stream_engine::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::state::AppState;

/// Cap on the multipart `metadata` part.
const METADATA_LIMIT: usize = 64 * 1024;
/// JSON envelope allowance on top of the base64-inflated frame.
const JSON_ENVELOPE_ALLOWANCE: usize = 64 * 1024;

/// Frame submission rejected before it reaches the engine.
#[derive(Debug, Error)]
pub enum FrameRejection {
    #[error("frame exceeds {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("{error}: {message}")]
    BadRequest { error: &'static str, message: String },
}

impl FrameRejection {
    fn bad_request(error: &'static str, message: impl Into<String>) -> Self {
        FrameRejection::BadRequest {
            error,
            message: message.into(),
        }
    }
}

impl ResponseError for FrameRejection {
    fn status_code(&self) -> StatusCode {
        match self {
            FrameRejection::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            FrameRejection::BadRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            FrameRejection::TooLarge { max_bytes } => {
                HttpResponse::PayloadTooLarge().json(json!({
                    "error": "Frame too large",
                    "message": format!("Frame size exceeds maximum of {} bytes", max_bytes),
                    "max_bytes": max_bytes,
                }))
            }
            FrameRejection::BadRequest { error, message } => {
                HttpResponse::BadRequest().json(json!({
                    "error": error,
                    "message": message,
                }))
            }
        }
    }
}

/// A decoded frame plus the envelope fields the engine needs.
struct FrameSubmission {
    stream_id: String,
    client_id: String,
    user_name: String,
    frame: VideoFrame,
    format_label: &'static str,
    ingress: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonFrameSubmission {
    stream_id: String,
    client_id: String,
    user_name: String,
    frame: Option<JsonFrame>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonFrame {
    frame_id: String,
    frame_data: Option<serde_json::Value>,
    timestamp: i64,
    camera_id: String,
    width: i32,
    height: i32,
    format: String,
    /// `"base64"` to decode `frame_data`; otherwise the string bytes are used as-is
    encoding: String,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MultipartMetadata {
    stream_id: String,
    client_id: String,
    user_name: String,
    width: i32,
    height: i32,
}

#[post("/start")]
pub async fn start_stream(
    state: web::Data<AppState>,
    body: web::Json<StartStreamRequest>,
) -> Result<HttpResponse, AppError> {
    let mut req = body.into_inner();
    let now = Utc::now().timestamp();

    if req.client_id.is_empty() {
        req.client_id = format!("client_{}", now);
    }
    if req.user_id.is_empty() {
        req.user_id = req.client_id.clone();
    }
    if req.camera_name.is_empty() {
        req.camera_name = "default_camera".to_string();
    }
    if req.filename.is_empty() {
        req.filename = format!("stream_{}_{}.mp4", req.client_id, now);
    }

    let details = json!({
        "client_id": req.client_id,
        "user_id": req.user_id,
        "camera_name": req.camera_name,
        "filename": req.filename,
    });

    let resp = state.streams.start_stream(req).await?;

    Ok(HttpResponse::Ok().json(json!({
        "stream_id": resp.stream_id,
        "status": resp.status,
        "message": resp.message,
        "timestamp": now,
        "details": details,
    })))
}

/// Accepts either a multipart form (`frame` file + `metadata` JSON) or a JSON envelope.
#[post("/frame")]
pub async fn send_frame(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let max_frame_size = state.config.video.max_frame_size;
    let is_multipart = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().contains("multipart/form-data"))
        .unwrap_or(false);

    let submission = if is_multipart {
        read_multipart_frame(&req, payload, max_frame_size).await?
    } else {
        read_json_frame(payload, max_frame_size).await?
    };

    let FrameSubmission {
        stream_id,
        client_id,
        user_name,
        frame,
        format_label,
        ingress,
    } = submission;
    let frame_size = frame.frame_data.len();

    let resp = state
        .streams
        .ingest_frame(&stream_id, &client_id, &user_name, Some(frame))
        .await?;
    if resp.status == "ok" {
        metrics::record_frame(ingress, frame_size);
    }

    let stream_id = resp
        .metadata
        .get("stream_id")
        .cloned()
        .unwrap_or(stream_id);

    Ok(HttpResponse::Ok().json(json!({
        "status": resp.status,
        "message": resp.message,
        "timestamp": resp.timestamp,
        "metadata": resp.metadata,
        "format": format_label,
        "frame_size": frame_size,
        "stream_id": stream_id,
    })))
}

#[post("/stop")]
pub async fn stop_stream(
    state: web::Data<AppState>,
    body: web::Json<StopStreamRequest>,
) -> HttpResponse {
    let mut req = body.into_inner();
    if req.end_time == 0 {
        req.end_time = Utc::now().timestamp();
    }

    let resp = state.streams.stop_stream(req).await;
    HttpResponse::Ok().json(resp)
}

#[get("/active")]
pub async fn active_streams(state: web::Data<AppState>) -> HttpResponse {
    let streams = state.streams.get_all_active_streams().await;

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "active_streams": streams.len(),
        "streams": streams,
        "timestamp": Utc::now().timestamp(),
    }))
}

#[get("/stats/{client_id}")]
pub async fn stats_by_client(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let client_id = path.into_inner();
    let stats = state.streams.get_stats_by_client(&client_id).await;

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "client_id": client_id,
        "stats": stats,
    }))
}

#[get("/client/{client_id}/streams")]
pub async fn streams_by_client(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let client_id = path.into_inner();
    let streams = state.streams.get_streams_by_client(&client_id).await;

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "client_id": client_id,
        "streams": streams,
    }))
}

#[get("/stream/{stream_id}")]
pub async fn get_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let stream_id = path.into_inner();
    let stream = state.streams.get_stream(&stream_id).await?;
    let stats = state.streams.get_stream_stats(&stream_id).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "stream": stream,
        "stats": stats,
    })))
}

#[get("/all-stats")]
pub async fn all_stats(state: web::Data<AppState>) -> HttpResponse {
    let stats = state.streams.get_all_stats().await;
    let total = state.streams.get_total_stats().await;

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "stats": stats,
        "total": total,
    }))
}

async fn read_json_frame(
    payload: web::Payload,
    max_frame_size: usize,
) -> Result<FrameSubmission, FrameRejection> {
    // base64 inflates by 4/3
    let body_limit = max_frame_size
        .saturating_mul(4)
        .saturating_div(3)
        .saturating_add(JSON_ENVELOPE_ALLOWANCE);
    let body = read_limited(payload, body_limit, max_frame_size).await?;

    let submission: JsonFrameSubmission = serde_json::from_slice(&body)
        .map_err(|e| FrameRejection::bad_request("Invalid request", e.to_string()))?;
    let frame = submission
        .frame
        .ok_or_else(|| FrameRejection::bad_request("Invalid request", "frame is required"))?;

    let data = match frame.frame_data {
        Some(serde_json::Value::String(text)) => {
            if frame.encoding.eq_ignore_ascii_case("base64") {
                STANDARD.decode(text.as_bytes()).map_err(|e| {
                    FrameRejection::bad_request(
                        "Invalid frame data",
                        format!("frame.frame_data is not valid base64: {}", e),
                    )
                })?
            } else {
                text.into_bytes()
            }
        }
        Some(_) => {
            return Err(FrameRejection::bad_request(
                "Invalid frame data",
                "frame.frame_data must be a string",
            ))
        }
        None => {
            return Err(FrameRejection::bad_request(
                "Invalid request",
                "frame.frame_data is required",
            ))
        }
    };
    if data.len() > max_frame_size {
        return Err(FrameRejection::TooLarge {
            max_bytes: max_frame_size,
        });
    }

    let now = Utc::now().timestamp();
    let client_id = if submission.client_id.is_empty() {
        format!("json_{}", now)
    } else {
        submission.client_id
    };
    let user_name = if submission.user_name.is_empty() {
        client_id.clone()
    } else {
        submission.user_name
    };

    let frame = VideoFrame {
        frame_id: frame.frame_id,
        frame_data: data,
        timestamp: if frame.timestamp > 0 { frame.timestamp } else { now },
        client_id: client_id.clone(),
        camera_id: non_empty_or(frame.camera_id, "json_camera"),
        width: positive_or(frame.width, DEFAULT_WIDTH),
        height: positive_or(frame.height, DEFAULT_HEIGHT),
        format: non_empty_or(frame.format, "jpeg"),
        metadata: frame.metadata,
    };

    Ok(FrameSubmission {
        stream_id: submission.stream_id,
        client_id,
        user_name,
        frame,
        format_label: "json_base64",
        ingress: ingress::HTTP_JSON,
    })
}

async fn read_multipart_frame(
    req: &HttpRequest,
    payload: web::Payload,
    max_frame_size: usize,
) -> Result<FrameSubmission, FrameRejection> {
    let mut multipart = Multipart::new(req.headers(), payload);
    let mut frame_part: Option<(Vec<u8>, String)> = None;
    let mut metadata = MultipartMetadata::default();

    while let Some(item) = multipart.next().await {
        let field = item
            .map_err(|e| FrameRejection::bad_request("Invalid multipart body", e.to_string()))?;
        let name = field
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| ContentDisposition::from_raw(v).ok())
            .and_then(|cd| cd.get_name().map(str::to_owned));

        match name.as_deref() {
            Some("frame") => {
                let content_type = field
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = read_limited(field, max_frame_size, max_frame_size).await?;
                frame_part = Some((data.to_vec(), content_type));
            }
            Some("metadata") => {
                let raw = read_limited(field, METADATA_LIMIT, max_frame_size).await?;
                metadata = serde_json::from_slice(&raw).map_err(|e| {
                    FrameRejection::bad_request(
                        "Invalid metadata",
                        format!("metadata must be a JSON object: {}", e),
                    )
                })?;
            }
            other => {
                warn!(field = ?other, "Ignoring unexpected multipart field");
                read_limited(field, max_frame_size, max_frame_size).await?;
            }
        }
    }

    let (data, content_type) = frame_part.ok_or_else(|| {
        FrameRejection::bad_request(
            "No frame file",
            "Please include 'frame' file in multipart form",
        )
    })?;

    let now = Utc::now().timestamp();
    let client_id = if metadata.client_id.is_empty() {
        format!("multipart_{}", now)
    } else {
        metadata.client_id
    };

    let frame = VideoFrame {
        frame_id: String::new(),
        frame_data: data,
        timestamp: now,
        client_id: client_id.clone(),
        camera_id: "multipart_stream".to_string(),
        width: positive_or(metadata.width, DEFAULT_WIDTH),
        height: positive_or(metadata.height, DEFAULT_HEIGHT),
        format: content_type,
        metadata: HashMap::new(),
    };

    Ok(FrameSubmission {
        stream_id: metadata.stream_id,
        client_id,
        user_name: non_empty_or(metadata.user_name, "multipart_client"),
        frame,
        format_label: "multipart",
        ingress: ingress::HTTP_MULTIPART,
    })
}

/// Buffer a body stream, failing as soon as it grows past `limit`.
async fn read_limited<S, E>(
    mut stream: S,
    limit: usize,
    max_frame_size: usize,
) -> Result<BytesMut, FrameRejection>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| FrameRejection::bad_request("Invalid request", e.to_string()))?;
        if body.len() + chunk.len() > limit {
            return Err(FrameRejection::TooLarge {
                max_bytes: max_frame_size,
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn positive_or(value: i32, default: i32) -> i32 {
    if value > 0 {
        value
    } else {
        default
    }
}
