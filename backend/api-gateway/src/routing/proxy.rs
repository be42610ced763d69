use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE};
use actix_web::http::StatusCode;
use actix_web::web::Bytes;
use actix_web::{Error, HttpRequest, HttpResponse, HttpResponseBuilder, ResponseError};
use bytes::BytesMut;
use futures_util::future::{ready, LocalBoxFuture, Ready};
use futures_util::{stream, StreamExt};
use reqwest::header as upstream_header;
use reqwest::redirect::Policy;
use reqwest::{Client, RequestBuilder};
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::table::{Backend, Dispatch, RouteTable};
use crate::metrics;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Time allowed for the upstream to send its response head. Bodies and
/// upgraded connections are not bounded.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

const BODY_CHANNEL_CAPACITY: usize = 8;
const TUNNEL_BUFFER: usize = 8 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request body exceeds {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("invalid method: {0}")]
    Method(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream did not respond within {}s", RESPONSE_TIMEOUT.as_secs())]
    Timeout,

    #[error("upstream returned invalid status {0}")]
    Status(u16),
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            ProxyError::TooLarge { max_bytes } => json!({
                "error": "payload too large",
                "message": self.to_string(),
                "max_bytes": max_bytes,
            }),
            ProxyError::Timeout => json!({
                "error": "gateway timeout",
                "message": self.to_string(),
            }),
            _ => json!({
                "error": "bad gateway",
                "message": self.to_string(),
            }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

/// Middleware that sends proxied paths to their backend and passes
/// everything else through to the app.
#[derive(Clone)]
pub struct ProxyDispatch {
    table: Arc<RouteTable>,
    client: Client,
    max_body_size: usize,
}

impl ProxyDispatch {
    pub fn new(table: RouteTable) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            table: Arc::new(table),
            client,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        })
    }

    /// Largest request body forwarded upstream; bigger bodies get a 413.
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for ProxyDispatch
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = ProxyDispatchService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ProxyDispatchService {
            service: Rc::new(service),
            table: self.table.clone(),
            client: self.client.clone(),
            max_body_size: self.max_body_size,
        }))
    }
}

pub struct ProxyDispatchService<S> {
    service: Rc<S>,
    table: Arc<RouteTable>,
    client: Client,
    max_body_size: usize,
}

impl<S, B> Service<ServiceRequest> for ProxyDispatchService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let backend = match self.table.resolve(req.path()) {
            Dispatch::Proxy(backend) => backend,
            Dispatch::Local | Dispatch::Translate => {
                let fut = self.service.call(req);
                return Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) });
            }
        };

        let client = self.client.clone();
        let max_body_size = self.max_body_size;
        Box::pin(async move {
            let (http_req, payload) = req.into_parts();

            let response = match forward(&client, &backend, &http_req, payload, max_body_size).await
            {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(
                        backend = backend.name,
                        path = %http_req.path(),
                        error = %e,
                        "Proxy request failed"
                    );
                    e.error_response()
                }
            };
            metrics::record_proxy_request(backend.name, response.status().as_u16());

            Ok(ServiceResponse::new(http_req, response).map_into_right_body())
        })
    }
}

async fn forward(
    client: &Client,
    backend: &Backend,
    req: &HttpRequest,
    payload: Payload,
    max_body_size: usize,
) -> Result<HttpResponse, ProxyError> {
    if content_length(req).is_some_and(|len| len > max_body_size) {
        return Err(ProxyError::TooLarge {
            max_bytes: max_body_size,
        });
    }

    let upstream = upstream_request(client, backend, req)?;
    match upgrade_protocol(req) {
        Some(protocol) => tunnel(upstream, protocol, payload).await,
        None if has_body(req) => relay(upstream, Some(payload), max_body_size).await,
        None => relay(upstream, None, max_body_size).await,
    }
}

/// Same method, path, query and end-to-end headers, plus X-Forwarded-For.
fn upstream_request(
    client: &Client,
    backend: &Backend,
    req: &HttpRequest,
) -> Result<RequestBuilder, ProxyError> {
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|_| ProxyError::Method(req.method().to_string()))?;
    let url = backend.target_url(req.path(), req.query_string());
    debug!(backend = backend.name, %method, url = %url, "Proxying request");

    let mut upstream = client.request(method, url);
    let mut forwarded_for: Option<String> = None;
    for (name, value) in req.headers().iter() {
        let name = name.as_str();
        if name == "host" || is_hop_by_hop(name) {
            continue;
        }
        if name == "x-forwarded-for" {
            forwarded_for = value.to_str().ok().map(str::to_owned);
            continue;
        }
        upstream = upstream.header(name, value.as_bytes());
    }
    if let Some(peer) = req.peer_addr() {
        let peer = peer.ip().to_string();
        forwarded_for = Some(match forwarded_for {
            Some(prior) if !prior.is_empty() => format!("{}, {}", prior, peer),
            _ => peer,
        });
    }
    if let Some(xff) = forwarded_for {
        upstream = upstream.header("x-forwarded-for", xff);
    }
    Ok(upstream)
}

/// Plain request/response exchange. Both bodies are streamed.
async fn relay(
    upstream: RequestBuilder,
    payload: Option<Payload>,
    max_body_size: usize,
) -> Result<HttpResponse, ProxyError> {
    let overflow = Rc::new(Cell::new(false));
    let upstream = match payload {
        Some(payload) => {
            // actix payloads are !Send, reqwest bodies must be Send
            let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
            actix_web::rt::spawn(pump_body(payload, tx, max_body_size, overflow.clone()));
            upstream.body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
        }
        None => upstream,
    };

    let resp = match tokio::time::timeout(RESPONSE_TIMEOUT, upstream.send()).await {
        Err(_) => return Err(ProxyError::Timeout),
        Ok(Err(_)) if overflow.get() => {
            return Err(ProxyError::TooLarge {
                max_bytes: max_body_size,
            })
        }
        Ok(res) => res?,
    };

    let mut builder = response_head(&resp)?;
    Ok(builder.streaming(resp.bytes_stream()))
}

async fn pump_body(
    mut payload: Payload,
    tx: mpsc::Sender<io::Result<Bytes>>,
    max_body_size: usize,
    overflow: Rc<Cell<bool>>,
) {
    let mut seen = 0usize;
    while let Some(chunk) = payload.next().await {
        let item = match chunk {
            Ok(chunk) => {
                seen += chunk.len();
                if seen > max_body_size {
                    overflow.set(true);
                    let _ = tx
                        .send(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "request body too large",
                        )))
                        .await;
                    return;
                }
                Ok(chunk)
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

/// Protocol upgrade (WebSocket and friends): relay the handshake, then
/// splice the client connection onto the upstream one.
async fn tunnel(
    upstream: RequestBuilder,
    protocol: String,
    mut payload: Payload,
) -> Result<HttpResponse, ProxyError> {
    let upstream = upstream
        .header(upstream_header::CONNECTION, "upgrade")
        .header(upstream_header::UPGRADE, protocol.as_str());
    let resp = tokio::time::timeout(RESPONSE_TIMEOUT, upstream.send())
        .await
        .map_err(|_| ProxyError::Timeout)??;

    let mut builder = response_head(&resp)?;
    if resp.status() != reqwest::StatusCode::SWITCHING_PROTOCOLS {
        debug!(status = resp.status().as_u16(), "Upstream refused upgrade");
        return Ok(builder.streaming(resp.bytes_stream()));
    }

    let accepted = resp
        .headers()
        .get(upstream_header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(protocol.as_str())
        .to_owned();
    builder.upgrade(accepted);

    let upgraded = resp.upgrade().await?;
    let (upstream_read, mut upstream_write) = tokio::io::split(upgraded);

    actix_web::rt::spawn(async move {
        while let Some(Ok(chunk)) = payload.next().await {
            if upstream_write.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = upstream_write.shutdown().await;
    });

    let downstream = stream::unfold(Some(upstream_read), |state| async move {
        let Some(mut reader) = state else {
            return None;
        };
        let mut buf = BytesMut::with_capacity(TUNNEL_BUFFER);
        match reader.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(buf.freeze()), Some(reader))),
            Err(e) => Some((Err(e), None)),
        }
    });

    Ok(builder.streaming(downstream))
}

fn response_head(resp: &reqwest::Response) -> Result<HttpResponseBuilder, ProxyError> {
    let status = resp.status().as_u16();
    let mut builder =
        HttpResponse::build(StatusCode::from_u16(status).map_err(|_| ProxyError::Status(status))?);
    for (name, value) in resp.headers().iter() {
        let name = name.as_str();
        if is_hop_by_hop(name) || name == "content-length" {
            continue;
        }
        builder.append_header((name, value.as_bytes()));
    }
    Ok(builder)
}

/// The protocol named in `Upgrade`, when `Connection` asks for one.
fn upgrade_protocol(req: &HttpRequest) -> Option<String> {
    let wants_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn content_length(req: &HttpRequest) -> Option<usize> {
    req.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn has_body(req: &HttpRequest) -> bool {
    req.headers().contains_key(TRANSFER_ENCODING) || content_length(req).is_some_and(|len| len > 0)
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}
