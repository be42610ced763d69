/// HTTP handlers
///
/// Local routes (health, readiness, metrics, status, rate-limit probe) and the
/// JSON translation of the video and client RPC operations.
///
/// ```text
/// HTTP JSON / multipart
///     ↓
/// handler (this module)
///     ↓
/// StreamEngine / ClientInfoService  ←  same instances the gRPC server uses
/// ```
pub mod clients;
pub mod health;
pub mod limits;
pub mod video;

use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;

use crate::metrics;

/// Limit for typed JSON bodies; frames have their own limit.
const JSON_BODY_LIMIT: usize = 1024 * 1024;

/// Paths served locally and never proxied.
pub const LOCAL_ROUTES: &[&str] = &[
    "/health",
    "/ready",
    "/metrics",
    "/api/v1/status",
    limits::RATE_LIMITED_PATH,
    limits::LEGACY_RATE_LIMITED_PATH,
];

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .limit(JSON_BODY_LIMIT)
            .error_handler(json_error_handler),
    )
    .app_data(web::QueryConfig::default().error_handler(query_error_handler))
    .service(health::health)
    .service(health::ready)
    .service(health::status)
    .route("/metrics", web::get().to(metrics::serve_metrics))
    .service(
        web::resource(limits::RATE_LIMITED_PATH)
            .route(web::get().to(limits::rate_limited))
            .route(web::post().to(limits::rate_limited)),
    )
    .service(
        web::resource(limits::LEGACY_RATE_LIMITED_PATH)
            .route(web::get().to(limits::rate_limited))
            .route(web::post().to(limits::rate_limited)),
    )
    .service(
        web::scope("/api/v1/video")
            .service(video::start_stream)
            .service(video::send_frame)
            .service(video::stop_stream)
            .service(video::active_streams)
            .service(video::stats_by_client)
            .service(video::streams_by_client)
            .service(video::get_stream)
            .service(video::all_stats),
    )
    .service(
        web::scope("/api/v1/clients")
            .service(clients::client_connected)
            .service(clients::client_disconnected)
            // before `/{client_id}` so "active" is not taken as an id
            .service(clients::list_active_clients)
            .service(clients::update_client)
            .service(clients::get_client),
    );
}

fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = match &err {
        JsonPayloadError::Overflow { .. } | JsonPayloadError::OverflowKnownLength { .. } => {
            HttpResponse::PayloadTooLarge().json(json!({
                "error": "Payload too large",
                "message": err.to_string(),
            }))
        }
        _ => HttpResponse::BadRequest().json(json!({
            "error": "Invalid request",
            "message": err.to_string(),
        })),
    };
    InternalError::from_response(err, response).into()
}

fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(json!({
        "error": "Invalid request",
        "message": err.to_string(),
    }));
    InternalError::from_response(err, response).into()
}
