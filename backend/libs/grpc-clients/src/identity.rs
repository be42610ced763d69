//! Identity lookups against user-service.
//!
//! Callers depend on [`IdentityClient`] only. Which implementation sits
//! behind the trait object is decided once, by [`connect_identity_client`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::transport::Channel;
use tonic::Code;
use tracing::{debug, info, warn};

use crate::config::IdentityClientConfig;
use crate::proto::user_service::user_service_client::UserServiceClient;
use crate::proto::user_service::{GetAvailableOperatorsRequest, GetUserRequest};
use crate::stub::StubIdentityClient;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    pub email: String,
    pub status: String,
}

/// Where and how a client should push its video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub server_url: String,
    pub port: u16,
    pub api_key: String,
    pub endpoint: String,
    pub bitrate: u32,
    pub resolution: u32,
    pub codec: String,
    pub use_tls: bool,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("user not found: {0}")]
    NotFound(String),

    #[error("identity service error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("identity service transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("identity service call timed out after {0:?}")]
    Timeout(Duration),

    #[error("identity client is closed")]
    Closed,
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn get_user_by_client_id(&self, client_id: &str) -> Result<UserInfo, IdentityError>;

    async fn get_streaming_config(&self, user_id: &str) -> Result<StreamingConfig, IdentityError>;

    async fn health_check(&self) -> Result<(), IdentityError>;

    async fn close(&self) -> Result<(), IdentityError>;
}

/// Identity client backed by a live user-service channel.
#[derive(Clone)]
pub struct GrpcIdentityClient {
    client: UserServiceClient<Channel>,
    request_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl GrpcIdentityClient {
    pub fn new(channel: Channel, request_timeout: Duration) -> Self {
        Self {
            client: UserServiceClient::new(channel),
            request_timeout,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Dial eagerly; fails if the service is not reachable within the connect timeout.
    pub async fn connect(config: &IdentityClientConfig) -> Result<Self, IdentityError> {
        let endpoint = config.make_endpoint()?;
        let channel = tokio::time::timeout(config.connect_timeout, endpoint.connect())
            .await
            .map_err(|_| IdentityError::Timeout(config.connect_timeout))??;
        Ok(Self::new(channel, config.request_timeout))
    }

    fn ensure_open(&self) -> Result<(), IdentityError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IdentityError::Closed);
        }
        Ok(())
    }
}

async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, IdentityError>
where
    F: Future<Output = Result<T, tonic::Status>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(IdentityError::from),
        Err(_) => Err(IdentityError::Timeout(deadline)),
    }
}

#[async_trait]
impl IdentityClient for GrpcIdentityClient {
    async fn get_user_by_client_id(&self, client_id: &str) -> Result<UserInfo, IdentityError> {
        self.ensure_open()?;
        if client_id.is_empty() {
            return Err(IdentityError::InvalidArgument(
                "client_id is required".to_string(),
            ));
        }

        let mut client = self.client.clone();
        let request = GetUserRequest {
            id: client_id.to_string(),
        };
        let user = match with_deadline(self.request_timeout, client.get_user(request)).await {
            Ok(response) => response.into_inner(),
            Err(IdentityError::Rpc(status)) if status.code() == Code::NotFound => {
                return Err(IdentityError::NotFound(client_id.to_string()));
            }
            Err(e) => return Err(e),
        };

        debug!(client_id = %client_id, username = %user.username, "Resolved user from identity service");

        Ok(UserInfo {
            id: user.id,
            username: user.username,
            email: user.email,
            status: user.status,
        })
    }

    async fn get_streaming_config(&self, user_id: &str) -> Result<StreamingConfig, IdentityError> {
        self.ensure_open()?;
        if user_id.is_empty() {
            return Err(IdentityError::InvalidArgument(
                "user_id is required".to_string(),
            ));
        }

        // user-service has no streaming-config RPC; the ingest target is fixed per deployment.
        Ok(StreamingConfig {
            server_url: "video-service-1".to_string(),
            port: 8080,
            api_key: format!("user-{}", user_id),
            endpoint: "/api/v1/video/frame".to_string(),
            bitrate: 5000,
            resolution: 1080,
            codec: "h264".to_string(),
            use_tls: false,
        })
    }

    async fn health_check(&self) -> Result<(), IdentityError> {
        self.ensure_open()?;
        let mut client = self.client.clone();
        let request = GetAvailableOperatorsRequest {
            limit: 1,
            offset: 0,
        };
        with_deadline(HEALTH_CHECK_TIMEOUT, client.get_available_operators(request)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), IdentityError> {
        // The channel itself is released when the last clone drops.
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Identity client closed");
        }
        Ok(())
    }
}

/// Connect to user-service, or fall back to the stub for the rest of the process.
pub async fn connect_identity_client(config: &IdentityClientConfig) -> Arc<dyn IdentityClient> {
    match GrpcIdentityClient::connect(config).await {
        Ok(client) => {
            info!(endpoint = %config.endpoint, "Connected to identity service");
            Arc::new(client)
        }
        Err(e) => {
            warn!(
                endpoint = %config.endpoint,
                error = %e,
                "Identity service unreachable, using stub identity client"
            );
            Arc::new(StubIdentityClient::new())
        }
    }
}
