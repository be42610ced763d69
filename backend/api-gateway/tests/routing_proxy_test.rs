mod common;

use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{test, web, App, HttpRequest, HttpResponse, HttpServer};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use api_gateway::config::BackendUrls;
use api_gateway::handlers;
use api_gateway::routing::{ProxyDispatch, RouteTable};
use common::default_state;

/// Upstream that echoes what it received, tagged with its name.
fn spawn_upstream(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = HttpServer::new(move || {
        App::new().default_service(web::to(move |req: HttpRequest, body: web::Bytes| async move {
            let header = |key: &str| {
                req.headers()
                    .get(key)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            HttpResponse::Created()
                .insert_header(("x-upstream", name))
                .json(json!({
                    "backend": name,
                    "method": req.method().as_str(),
                    "path": req.path(),
                    "query": req.query_string(),
                    "forwarded_for": header("x-forwarded-for"),
                    "custom": header("x-custom"),
                    "body": String::from_utf8_lossy(&body),
                }))
        }))
    })
    .workers(1)
    .disable_signals()
    .listen(listener)
    .unwrap()
    .run();
    actix_web::rt::spawn(server);

    addr
}

/// Upstream that accepts any upgrade and echoes the raw connection back.
fn spawn_upgrade_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = HttpServer::new(|| {
        App::new().default_service(web::to(|req: HttpRequest, payload: web::Payload| async move {
            let header = |key: &str| {
                req.headers()
                    .get(key)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("<absent>")
                    .to_string()
            };
            HttpResponse::SwitchingProtocols()
                .upgrade("websocket")
                .insert_header(("x-seen-upgrade", header("upgrade")))
                .insert_header(("x-seen-key", header("sec-websocket-key")))
                .insert_header(("x-seen-path", req.path().to_string()))
                .streaming(payload)
        }))
    })
    .workers(1)
    .disable_signals()
    .listen(listener)
    .unwrap()
    .run();
    actix_web::rt::spawn(server);

    addr
}

/// Gateway on a real socket, for requests `init_service` cannot express.
fn spawn_gateway(proxy: ProxyDispatch) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let state = default_state();

    let server = HttpServer::new(move || {
        App::new()
            .wrap(proxy.clone())
            .app_data(web::Data::new(state.clone()))
            .configure(handlers::configure)
    })
    .workers(1)
    .disable_signals()
    .listen(listener)
    .unwrap()
    .run();
    actix_web::rt::spawn(server);

    addr
}

/// Reads up to the blank line, leaving anything after it on the socket.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed before the response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap().to_ascii_lowercase()
}

fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn route_table(users: SocketAddr, directory: SocketAddr) -> RouteTable {
    RouteTable::from_backends(&BackendUrls {
        user_service: Some(format!("http://{}", users)),
        operator_directory: Some(format!("http://{}", directory)),
        ticket_service: Some(format!("http://{}", closed_port())),
        ..Default::default()
    })
}

#[actix_web::test]
async fn proxies_by_prefix_and_suffix_override() {
    let users = spawn_upstream("users");
    let directory = spawn_upstream("directory");

    let app = test::init_service(
        App::new()
            .wrap(ProxyDispatch::new(route_table(users, directory)).unwrap())
            .app_data(web::Data::new(default_state()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/users/42?expand=profile")
        .peer_addr("10.1.1.1:5000".parse().unwrap())
        .insert_header(("X-Forwarded-For", "203.0.113.9"))
        .insert_header(("X-Custom", "kept"))
        .set_payload("hello upstream")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(resp.headers().get("x-upstream").unwrap(), "users");

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["method"], "POST");
    assert_eq!(body["path"], "/api/v1/users/42");
    assert_eq!(body["query"], "expand=profile");
    assert_eq!(body["forwarded_for"], "203.0.113.9, 10.1.1.1");
    assert_eq!(body["custom"], "kept");
    assert_eq!(body["body"], "hello upstream");

    let req = test::TestRequest::get()
        .uri("/api/v1/operators/op-7/availability")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["backend"], "users");

    let req = test::TestRequest::get()
        .uri("/api/v1/operators/op-7")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["backend"], "directory");
}

#[actix_web::test]
async fn local_and_translated_routes_are_not_proxied() {
    let users = spawn_upstream("users");
    let directory = spawn_upstream("directory");

    let app = test::init_service(
        App::new()
            .wrap(ProxyDispatch::new(route_table(users, directory)).unwrap())
            .app_data(web::Data::new(default_state()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["service"], "api-gateway");

    let req = test::TestRequest::get().uri("/api/v1/video/active").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["active_streams"], 0);

    let req = test::TestRequest::get().uri("/no/such/route").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn unreachable_backend_is_502() {
    let users = spawn_upstream("users");
    let directory = spawn_upstream("directory");

    let app = test::init_service(
        App::new()
            .wrap(ProxyDispatch::new(route_table(users, directory)).unwrap())
            .app_data(web::Data::new(default_state()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/tickets/1").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "bad gateway");
}

#[actix_web::test]
async fn oversized_body_is_413_before_reaching_backend() {
    let users = spawn_upstream("users");
    let directory = spawn_upstream("directory");

    let app = test::init_service(
        App::new()
            .wrap(
                ProxyDispatch::new(route_table(users, directory))
                    .unwrap()
                    .max_body_size(8),
            )
            .app_data(web::Data::new(default_state()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/users/42")
        .set_payload("0123456789abcdef")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "payload too large");
    assert_eq!(body["max_bytes"], 8);

    let req = test::TestRequest::post()
        .uri("/api/v1/users/42")
        .set_payload("small")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["body"], "small");
}

#[actix_web::test]
async fn chunked_body_over_limit_is_413() {
    let users = spawn_upstream("users");
    let directory = spawn_upstream("directory");
    let gateway = spawn_gateway(
        ProxyDispatch::new(route_table(users, directory))
            .unwrap()
            .max_body_size(8),
    );

    let mut stream = TcpStream::connect(gateway).await.unwrap();
    stream
        .write_all(
            b"POST /api/v1/users/42 HTTP/1.1\r\n\
              Host: gateway\r\n\
              Transfer-Encoding: chunked\r\n\
              Connection: close\r\n\r\n\
              10\r\n0123456789abcdef\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let head = tokio::time::timeout(Duration::from_secs(10), read_head(&mut stream))
        .await
        .unwrap();
    assert!(head.starts_with("http/1.1 413"), "{}", head);
}

#[actix_web::test]
async fn websocket_handshake_is_tunnelled() {
    let notify = spawn_upgrade_upstream();
    let table = RouteTable::from_backends(&BackendUrls {
        notification_service: Some(format!("http://{}", notify)),
        ..Default::default()
    });
    let gateway = spawn_gateway(ProxyDispatch::new(table).unwrap());

    let mut stream = TcpStream::connect(gateway).await.unwrap();
    stream
        .write_all(
            b"GET /ws/notify/room1 HTTP/1.1\r\n\
              Host: gateway\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let head = tokio::time::timeout(Duration::from_secs(10), read_head(&mut stream))
        .await
        .unwrap();
    assert!(head.starts_with("http/1.1 101"), "{}", head);
    assert!(head.contains("upgrade: websocket"), "{}", head);
    assert!(head.contains("x-seen-upgrade: websocket"), "{}", head);
    assert!(head.contains("x-seen-key: dghlihnhbxbszsbub25jzq=="), "{}", head);
    assert!(head.contains("x-seen-path: /ws/notify/room1"), "{}", head);

    // bytes now flow both ways over the spliced connection
    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
}
