use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

static FRAMES_RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "gateway_frames_received_total",
            "Video frames accepted by the ingestion engine",
        ),
        &["ingress"],
    )
    .expect("failed to create gateway_frames_received_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register gateway_frames_received_total");
    counter
});

static FRAME_BYTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "gateway_frame_bytes_total",
        "Payload bytes accepted by the ingestion engine",
    )
    .expect("failed to create gateway_frame_bytes_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register gateway_frame_bytes_total");
    counter
});

static STREAMS_AUTO_PROVISIONED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "gateway_streams_auto_provisioned_total",
        "Streams created implicitly by a frame for an unknown stream id",
    )
    .expect("failed to create gateway_streams_auto_provisioned_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register gateway_streams_auto_provisioned_total");
    counter
});

static ACTIVE_STREAMS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("gateway_active_streams", "Streams currently tracked")
        .expect("failed to create gateway_active_streams");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register gateway_active_streams");
    gauge
});

static RATE_LIMITED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "gateway_rate_limited_total",
        "Requests rejected by the fixed-window rate limiter",
    )
    .expect("failed to create gateway_rate_limited_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register gateway_rate_limited_total");
    counter
});

static PROXY_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "gateway_proxy_requests_total",
            "Requests forwarded to backend services",
        ),
        &["backend", "status"],
    )
    .expect("failed to create gateway_proxy_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register gateway_proxy_requests_total");
    counter
});

/// Ingress label values for [`record_frame`].
pub mod ingress {
    pub const HTTP_JSON: &str = "http_json";
    pub const HTTP_MULTIPART: &str = "http_multipart";
    pub const GRPC_UNARY: &str = "grpc_unary";
    pub const GRPC_STREAM: &str = "grpc_stream";
}

pub fn record_frame(ingress: &str, bytes: usize) {
    FRAMES_RECEIVED_TOTAL.with_label_values(&[ingress]).inc();
    FRAME_BYTES_TOTAL.inc_by(bytes as u64);
}

pub fn record_auto_provisioned() {
    STREAMS_AUTO_PROVISIONED_TOTAL.inc();
}

pub fn set_active_streams(count: usize) {
    ACTIVE_STREAMS.set(count as i64);
}

pub fn record_rate_limited() {
    RATE_LIMITED_TOTAL.inc();
}

pub fn record_proxy_request(backend: &str, status: u16) {
    let status_label = status.to_string();
    PROXY_REQUESTS_TOTAL
        .with_label_values(&[backend, &status_label])
        .inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
