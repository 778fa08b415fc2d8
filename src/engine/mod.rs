//! Engine processes and the supervisor that maps users onto them.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use engine_rpc::{RemoteHandle, RpcError};
use thiserror::Error;

use crate::model::StoreError;

pub mod manager;
pub mod process;

pub use manager::EngineManager;
pub use process::{EngineProcess, ProcessEvent, ProcessState};

/// How a dedicated engine process is confined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    None,
    /// Launch through `wrapper -i <cloud id> ...`.
    Sandboxed { wrapper: PathBuf },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} is not running")]
    NotRunning(i64),
    #[error("engine of user {0} is dead")]
    EngineDead(i64),
    #[error("failed to spawn engine process {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("engine process {id} exited with code {code:?} before completing the handshake")]
    Exited { id: String, code: Option<i32> },
    #[error("engine process {id} did not complete the handshake within {timeout:?}")]
    HandshakeTimeout { id: String, timeout: Duration },
    #[error("engine process {0} is not ready")]
    NotReady(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Routine conditions callers are expected to handle quietly.
    pub fn is_not_running(&self) -> bool {
        matches!(self, EngineError::NotRunning(_) | EngineError::EngineDead(_))
    }
}

/// Sub-objects of a running engine, resolved once when the engine starts.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    pub apps: RemoteHandle,
    pub devices: RemoteHandle,
    pub ui: RemoteHandle,
    pub assistant: RemoteHandle,
    pub messaging: RemoteHandle,
}

/// What the supervisor tells the chat side about engines coming and going.
pub trait ChatDispatcher: Send + Sync {
    fn add_engine(&self, account: &str, engine: EngineHandle);
    fn remove_engine(&self, account: &str);
    fn remove_all_engines(&self);
    /// Leaves every conversation of `account`.
    fn delete_user(&self, account: &str);
}

/// What the chat side needs from the supervisor.
#[async_trait]
pub trait EngineDirectory: Send + Sync {
    fn get_engine(&self, user_id: i64) -> Result<EngineHandle, EngineError>;
    async fn start_user(&self, user_id: i64) -> Result<(), EngineError>;
}

pub fn websocket_path(cloud_id: &str) -> String {
    format!("/ws/{cloud_id}")
}
