//! Non-networked identity client.
//!
//! Returns deterministic synthetic users so the gateway keeps serving when
//! user-service is down at startup.

use async_trait::async_trait;

use crate::identity::{IdentityClient, IdentityError, StreamingConfig, UserInfo};

#[derive(Debug, Clone, Default)]
pub struct StubIdentityClient;

impl StubIdentityClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IdentityClient for StubIdentityClient {
    async fn get_user_by_client_id(&self, client_id: &str) -> Result<UserInfo, IdentityError> {
        if client_id.is_empty() {
            return Err(IdentityError::InvalidArgument(
                "client_id is required".to_string(),
            ));
        }

        Ok(UserInfo {
            id: client_id.to_string(),
            username: format!("user_{}", client_id),
            email: format!("user_{}@example.com", client_id),
            status: "active".to_string(),
        })
    }

    async fn get_streaming_config(&self, user_id: &str) -> Result<StreamingConfig, IdentityError> {
        if user_id.is_empty() {
            return Err(IdentityError::InvalidArgument(
                "user_id is required".to_string(),
            ));
        }

        Ok(StreamingConfig {
            server_url: "video-service-1.example.com".to_string(),
            port: 8082,
            api_key: format!("video_api_key_{}", user_id),
            endpoint: "/api/v1/video/stream".to_string(),
            bitrate: 5000,
            resolution: 1080,
            codec: "h264".to_string(),
            use_tls: false,
        })
    }

    async fn health_check(&self) -> Result<(), IdentityError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), IdentityError> {
        Ok(())
    }
}
