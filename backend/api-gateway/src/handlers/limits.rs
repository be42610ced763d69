use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use tracing::debug;

use crate::metrics;
use crate::services::RateDecision;
use crate::state::AppState;

pub const RATE_LIMITED_PATH: &str = "/api/v1/limits/rate-limited";
pub const LEGACY_RATE_LIMITED_PATH: &str = "/v1/limits/rate-limited";

/// Source key: first `X-Forwarded-For`/`Forwarded` hop, else the peer IP.
pub fn client_key(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string()
}

pub async fn rate_limited(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let key = client_key(&req);

    match state.rate_limiter.check(&key) {
        RateDecision::Allowed => HttpResponse::Ok().json(json!({
            "status": "ok",
            "message": "rate-limited endpoint",
        })),
        RateDecision::Limited { retry_after } => {
            metrics::record_rate_limited();
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            debug!(key = %key, retry_after_secs = secs, "Rate limit exceeded");

            HttpResponse::TooManyRequests()
                .insert_header((header::RETRY_AFTER, secs.max(1).to_string()))
                .json(json!({
                    "error": "rate limit exceeded",
                    "message": "too many requests",
                }))
        }
    }
}
