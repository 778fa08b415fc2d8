//! Routes inbound webhook callbacks to the engine owning the cloud id.

use std::collections::BTreeMap;

use dashmap::DashMap;
use engine_rpc::{RemoteHandle, RpcError};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("no engine registered for {0}")]
    UnknownClient(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// One inbound callback, as received by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub id: String,
    pub method: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Value,
}

#[derive(Debug, Default)]
pub struct WebhookDispatcher {
    clients: DashMap<String, RemoteHandle>,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&self, cloud_id: &str, handler: RemoteHandle) {
        debug!(cloud_id, "webhook client added");
        self.clients.insert(cloud_id.to_string(), handler);
    }

    pub fn remove_client(&self, cloud_id: &str) {
        if self.clients.remove(cloud_id).is_some() {
            debug!(cloud_id, "webhook client removed");
        }
    }

    pub fn remove_all_clients(&self) {
        self.clients.clear();
    }

    pub fn has_client(&self, cloud_id: &str) -> bool {
        self.clients.contains_key(cloud_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Forwards a callback to the engine's `handleCallback`.
    pub async fn dispatch(&self, cloud_id: &str, req: WebhookRequest) -> Result<Value, WebhookError> {
        let handler = self
            .clients
            .get(cloud_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| WebhookError::UnknownClient(cloud_id.to_string()))?;
        let reply = handler
            .call(
                "handleCallback",
                vec![json!(req.id), json!(req.method), json!(req.query), json!(req.headers), req.payload],
            )
            .await?;
        Ok(reply)
    }
}
