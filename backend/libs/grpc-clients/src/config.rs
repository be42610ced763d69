/// Identity client configuration
///
/// Endpoint and timeouts for the user-service connection. Values are
/// resolved by the embedding service; this crate never reads the environment.
use std::time::Duration;

use tonic::transport::Endpoint;

#[derive(Debug, Clone)]
pub struct IdentityClientConfig {
    /// user-service gRPC endpoint, e.g. `http://user-service:9090`
    pub endpoint: String,

    /// Upper bound for the initial dial
    pub connect_timeout: Duration,

    /// Per-call deadline
    pub request_timeout: Duration,
}

impl Default for IdentityClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9090".to_string(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl IdentityClientConfig {
    /// Build a tonic Endpoint with the configured timeouts
    pub fn make_endpoint(&self) -> Result<Endpoint, tonic::transport::Error> {
        Ok(Endpoint::from_shared(self.endpoint.clone())?
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .tcp_nodelay(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_points_at_local_user_service() {
        let config = IdentityClientConfig::default();
        assert_eq!(config.endpoint, "http://localhost:9090");
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert!(config.make_endpoint().is_ok());
    }

    #[test]
    fn rejects_malformed_endpoint() {
        let config = IdentityClientConfig {
            endpoint: "not a uri".to_string(),
            ..Default::default()
        };
        assert!(config.make_endpoint().is_err());
    }
}
