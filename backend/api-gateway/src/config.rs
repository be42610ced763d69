use anyhow::{anyhow, Context, Result};
use grpc_clients::IdentityClientConfig;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub identity: IdentityClientConfig,
    pub backends: BackendUrls,
    pub proxy: ProxyConfig,
    pub video: VideoConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub grpc_port: u16,
    /// `None` keeps the actix default (one worker per physical core)
    pub workers: Option<usize>,
    /// Graceful drain deadline for both listeners
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            grpc_port: 9090,
            workers: None,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }

    pub fn grpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.grpc_port)
    }
}

/// Reverse-proxy targets. `None` means the path space is not proxied.
#[derive(Debug, Clone, Default)]
pub struct BackendUrls {
    pub user_service: Option<String>,
    pub session_manager: Option<String>,
    pub ticket_service: Option<String>,
    pub search_service: Option<String>,
    pub operator_directory: Option<String>,
    pub operator_pool: Option<String>,
    pub notification_service: Option<String>,
    pub data_channel: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Request bodies above this size are answered with 413
    pub max_body_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_body_size: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub max_frame_size: usize,
    pub default_codec: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 10 * 1024 * 1024,
            default_codec: "H.264".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let server = ServerConfig {
            host: first_of(&["APP_HOST", "HOST"]).unwrap_or_else(|| "0.0.0.0".to_string()),
            http_port: parse_or(&["SERVER_PORT", "HTTP_PORT"], 8080)?,
            grpc_port: parse_or(&["GRPC_PORT"], 9090)?,
            workers: first_of(&["HTTP_WORKERS"])
                .map(|v| v.parse::<usize>())
                .transpose()
                .context("HTTP_WORKERS must be a positive integer")?
                .filter(|w| *w > 0),
            shutdown_timeout: Duration::from_secs(parse_or(&["SHUTDOWN_TIMEOUT_SECS"], 10)?),
        };

        let identity_endpoint = match first_of(&["USER_SERVICE_GRPC_URL"]) {
            Some(url) => url,
            None => {
                let host = first_of(&["USER_SERVICE_HOST"]).unwrap_or_else(|| "localhost".to_string());
                let port: u16 = parse_or(&["USER_SERVICE_PORT"], 9090)?;
                format!("http://{}:{}", host, port)
            }
        };
        let identity = IdentityClientConfig {
            endpoint: identity_endpoint,
            connect_timeout: Duration::from_secs(parse_or(&["USER_SERVICE_DIAL_TIMEOUT_SEC"], 3)?),
            request_timeout: Duration::from_secs(parse_or(
                &["USER_SERVICE_REQUEST_TIMEOUT_SEC"],
                5,
            )?),
        };

        let backends = BackendUrls {
            user_service: first_of(&["USER_SERVICE_HTTP_URL"]),
            session_manager: first_of(&["SESSION_MANAGER_URL"]),
            ticket_service: first_of(&["TICKET_SERVICE_URL"]),
            search_service: first_of(&["SEARCH_SERVICE_URL"]),
            operator_directory: first_of(&["OPERATOR_DIRECTORY_URL"]),
            operator_pool: first_of(&["OPERATOR_POOL_URL"]),
            notification_service: first_of(&["NOTIFICATION_SERVICE_URL"]),
            data_channel: first_of(&["DATA_CHANNEL_SERVICE_URL"]),
        };

        let proxy = ProxyConfig {
            max_body_size: parse_or(&["PROXY_MAX_BODY_SIZE"], 32 * 1024 * 1024)?,
        };

        let video = VideoConfig {
            max_frame_size: parse_or(&["VIDEO_MAX_FRAME_SIZE"], 10 * 1024 * 1024)?,
            default_codec: first_of(&["VIDEO_DEFAULT_CODEC"]).unwrap_or_else(|| "H.264".to_string()),
        };

        let window_ms: u64 = parse_or(&["RATE_LIMIT_WINDOW_MS"], 1000)?;
        if window_ms == 0 {
            return Err(anyhow!("RATE_LIMIT_WINDOW_MS must be greater than zero"));
        }
        let rate_limit = RateLimitConfig {
            max_requests: parse_or(&["RATE_LIMIT_MAX_REQUESTS"], 5)?,
            window: Duration::from_millis(window_ms),
        };

        let logging = LoggingConfig {
            level: first_of(&["LOG_LEVEL"]).unwrap_or_else(|| "info".to_string()),
            format: match first_of(&["LOG_FORMAT"]).as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
        };

        Ok(Self {
            server,
            identity,
            backends,
            proxy,
            video,
            rate_limit,
            logging,
        })
    }
}

/// First non-empty value among `keys`.
fn first_of(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn parse_or<T>(keys: &[&str], default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match first_of(keys) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("invalid value {:?} for {}: {}", raw, keys.join("/"), e)),
        None => Ok(default),
    }
}
