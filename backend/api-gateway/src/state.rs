use std::sync::Arc;

use grpc_clients::IdentityClient;

use crate::config::Config;
use crate::services::{ClientInfoService, ClientRegistry, FixedWindowLimiter, StreamEngine};

/// Shared by the HTTP app factory and the gRPC service impls.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub streams: Arc<StreamEngine>,
    pub clients: ClientInfoService,
    pub rate_limiter: Arc<FixedWindowLimiter>,
    pub identity: Arc<dyn IdentityClient>,
}

impl AppState {
    pub fn new(config: Config, identity: Arc<dyn IdentityClient>) -> Self {
        let streams = Arc::new(StreamEngine::new(
            identity.clone(),
            config.video.default_codec.clone(),
        ));
        let rate_limiter = Arc::new(FixedWindowLimiter::from_config(&config.rate_limit));

        Self {
            config: Arc::new(config),
            streams,
            clients: ClientInfoService::new(ClientRegistry::new()),
            rate_limiter,
            identity,
        }
    }
}
