use anyhow::{Context, Result};
use grpc_clients::connect_identity_client;
use tracing::{info, warn};

use api_gateway::logging::init_tracing;
use api_gateway::{shutdown_signal, AppState, Config, Gateway};

#[actix_web::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!(
        http = %config.server.http_addr(),
        grpc = %config.server.grpc_addr(),
        identity = %config.identity.endpoint,
        "Starting api-gateway"
    );

    let identity = connect_identity_client(&config.identity).await;
    let state = AppState::new(config, identity.clone());

    let gateway = Gateway::bind(state)
        .await
        .context("Failed to bind listeners")?;
    let result = gateway.run_until(shutdown_signal()).await;

    if let Err(e) = identity.close().await {
        warn!(error = %e, "Failed to close identity client");
    }
    info!("api-gateway shut down");

    result.context("Gateway exited with an error")
}
