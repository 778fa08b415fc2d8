//! Websocket endpoints the HTTP frontend hands upgrades to.
//!
//! The HTTP server itself lives outside this crate; it looks up the path of
//! an upgrade request here and passes the request metadata on.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use engine_rpc::WebSocketRequest;
use tracing::debug;

use crate::engine::EngineError;

/// An HTTP upgrade request and the bytes read past its header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub http_version: String,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub head: Vec<u8>,
}

impl UpgradeRequest {
    pub fn metadata(&self) -> WebSocketRequest {
        WebSocketRequest {
            http_version: self.http_version.clone(),
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
        }
    }
}

pub type UpgradeHandler = Arc<dyn Fn(UpgradeRequest) -> Result<(), EngineError> + Send + Sync>;

pub trait WebSocketRegistry: Send + Sync {
    fn register_endpoint(&self, path: &str, handler: UpgradeHandler);
    fn unregister_endpoint(&self, path: &str);
}

#[derive(Default)]
pub struct EndpointTable {
    endpoints: DashMap<String, UpgradeHandler>,
}

impl std::fmt::Debug for EndpointTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let paths: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("EndpointTable").field("endpoints", &paths).finish()
    }
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.endpoints.contains_key(path)
    }

    /// Hands `req` to the endpoint registered for `path`. Returns `Ok(false)`
    /// when nothing is registered there.
    pub fn handle_upgrade(&self, path: &str, req: UpgradeRequest) -> Result<bool, EngineError> {
        let Some(handler) = self.endpoints.get(path).map(|h| Arc::clone(h.value())) else {
            return Ok(false);
        };
        handler(req)?;
        Ok(true)
    }
}

impl WebSocketRegistry for EndpointTable {
    fn register_endpoint(&self, path: &str, handler: UpgradeHandler) {
        debug!(path, "websocket endpoint registered");
        self.endpoints.insert(path.to_string(), handler);
    }

    fn unregister_endpoint(&self, path: &str) {
        if self.endpoints.remove(path).is_some() {
            debug!(path, "websocket endpoint unregistered");
        }
    }
}
