use std::collections::HashMap;

use chrono::Utc;
use tracing::info;

use super::client_registry::ClientRegistry;
use crate::error::{AppError, Result};
use crate::proto::video::client_info::ClientStats;
use crate::proto::video::{ApiResponse, ClientInfo, ConnectionEvent, ListClientsResponse};

pub const DEFAULT_PAGE: i32 = 1;
pub const DEFAULT_LIMIT: i32 = 20;
pub const MAX_LIMIT: i32 = 100;

/// Connect/disconnect/update operations over the [`ClientRegistry`].
#[derive(Clone, Default)]
pub struct ClientInfoService {
    registry: ClientRegistry,
}

impl ClientInfoService {
    pub fn new(registry: ClientRegistry) -> Self {
        Self { registry }
    }

    pub async fn client_connected(&self, event: ConnectionEvent) -> Result<ApiResponse> {
        let mut client = event.client_info.unwrap_or_default();
        let client_id = if event.client_id.is_empty() {
            client.client_id.clone()
        } else {
            event.client_id
        };
        if client_id.is_empty() {
            return Err(AppError::InvalidArgument("client_id is required".to_string()));
        }

        client.client_id = client_id.clone();
        if client.ip_address.is_empty() {
            client.ip_address = event.ip_address;
        }
        if client.user_agent.is_empty() {
            client.user_agent = event.user_agent;
        }
        let stats = client.stats.get_or_insert_with(ClientStats::default);
        if stats.connected_at == 0 {
            stats.connected_at = if event.timestamp > 0 {
                event.timestamp
            } else {
                Utc::now().timestamp()
            };
        }

        self.registry.save_client(client).await;
        info!(client_id = %client_id, "Client connected");

        Ok(ack("Client connected successfully", &client_id))
    }

    /// Idempotent.
    pub async fn client_disconnected(&self, event: ConnectionEvent) -> Result<ApiResponse> {
        if event.client_id.is_empty() {
            return Err(AppError::InvalidArgument("client_id is required".to_string()));
        }

        if self.registry.remove_client(&event.client_id).await.is_some() {
            info!(client_id = %event.client_id, "Client disconnected");
        }

        Ok(ack("Client disconnected", &event.client_id))
    }

    pub async fn update_client_info(
        &self,
        client_id: &str,
        client_info: Option<ClientInfo>,
    ) -> Result<ApiResponse> {
        if client_id.is_empty() {
            return Err(AppError::InvalidArgument("client_id is required".to_string()));
        }
        let mut client = client_info
            .ok_or_else(|| AppError::InvalidArgument("client_info is required".to_string()))?;

        client.client_id = client_id.to_string();
        self.registry.save_client(client).await;

        Ok(ack("Client info updated", client_id))
    }

    pub async fn get_client_info(&self, client_id: &str) -> Result<ClientInfo> {
        self.registry
            .get_client(client_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("client {}", client_id)))
    }

    /// Page through clients ordered by `client_id`.
    pub async fn list_active_clients(&self, page: i32, limit: i32) -> ListClientsResponse {
        let page = if page < 1 { DEFAULT_PAGE } else { page };
        let limit = if !(1..=MAX_LIMIT).contains(&limit) {
            DEFAULT_LIMIT
        } else {
            limit
        };

        let mut clients = self.registry.get_all_clients().await;
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        let total = clients.len() as i32;

        let start = ((page - 1) as usize).saturating_mul(limit as usize);
        let clients = clients
            .into_iter()
            .skip(start)
            .take(limit as usize)
            .collect();

        ListClientsResponse {
            clients,
            total,
            page,
            limit,
        }
    }
}

fn ack(message: &str, client_id: &str) -> ApiResponse {
    ApiResponse {
        status: "ok".to_string(),
        message: message.to_string(),
        timestamp: Utc::now().timestamp(),
        metadata: HashMap::from([("client_id".to_string(), client_id.to_string())]),
    }
}
