use actix_web::{get, web, HttpResponse, Responder};
use chrono::Utc;
use serde_json::json;

use crate::state::AppState;

pub const SERVICE_NAME: &str = "api-gateway";

#[get("/health")]
pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "time": Utc::now().timestamp(),
    }))
}

#[get("/ready")]
pub async fn ready() -> impl Responder {
    HttpResponse::Ok().content_type("text/plain").body("OK")
}

/// Introspection: identity reachability and the locally served endpoints.
#[get("/api/v1/status")]
pub async fn status(state: web::Data<AppState>) -> impl Responder {
    let identity = match state.identity.health_check().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "Identity health check failed");
            "unavailable"
        }
    };

    HttpResponse::Ok().json(json!({
        "status": "running",
        "timestamp": Utc::now().timestamp(),
        "identity": identity,
        "endpoints": [
            "GET /health",
            "GET /ready",
            "GET /metrics",
            "GET /api/v1/status",
            "GET|POST /api/v1/limits/rate-limited",
            "POST /api/v1/video/start",
            "POST /api/v1/video/frame",
            "POST /api/v1/video/stop",
            "GET /api/v1/video/active",
            "GET /api/v1/video/stats/{client_id}",
            "GET /api/v1/video/client/{client_id}/streams",
            "GET /api/v1/video/stream/{stream_id}",
            "GET /api/v1/video/all-stats",
            "POST /api/v1/clients/connected",
            "POST /api/v1/clients/disconnected",
            "PUT /api/v1/clients/{client_id}",
            "GET /api/v1/clients/{client_id}",
            "GET /api/v1/clients/active",
        ],
    }))
}
