#![allow(dead_code)]

use std::sync::Arc;

use api_gateway::{AppState, Config};
use grpc_clients::StubIdentityClient;

/// Ports set to 0 so gateway tests can bind without clashing.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.http_port = 0;
    config.server.grpc_port = 0;
    config.server.workers = Some(1);
    config
}

pub fn build_state(config: Config) -> AppState {
    AppState::new(config, Arc::new(StubIdentityClient::new()))
}

pub fn default_state() -> AppState {
    build_state(test_config())
}

pub const BOUNDARY: &str = "----gateway-test-boundary";

/// Hand-built `multipart/form-data` body.
pub fn multipart_body(parts: &[(&str, Option<&str>, &str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, content_type, data) in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    name, filename
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n", name).as_bytes(),
            ),
        }
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={}", BOUNDARY)
}
