use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::proto::video::client_info::ClientStats;
use crate::proto::video::ClientInfo;

/// In-memory store of connected clients keyed by `client_id`.
///
/// Independent of the stream table's lock. Records stay until an explicit
/// removal; there is no expiry.
#[derive(Default, Clone)]
pub struct ClientRegistry {
    inner: Arc<RwLock<HashMap<String, ClientInfo>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert, stamping `stats.last_activity` with the current time.
    pub async fn save_client(&self, mut client: ClientInfo) {
        let stats = client.stats.get_or_insert_with(ClientStats::default);
        stats.last_activity = Utc::now().timestamp();

        let mut guard = self.inner.write().await;
        guard.insert(client.client_id.clone(), client);
    }

    pub async fn get_client(&self, client_id: &str) -> Option<ClientInfo> {
        self.inner.read().await.get(client_id).cloned()
    }

    /// Returns the removed record, if any.
    pub async fn remove_client(&self, client_id: &str) -> Option<ClientInfo> {
        self.inner.write().await.remove(client_id)
    }

    pub async fn get_all_clients(&self) -> Vec<ClientInfo> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
