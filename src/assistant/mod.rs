//! Chat side of the cloud: feeds on the messaging service become
//! conversations with the users' engines.

use engine_rpc::RpcError;
use thiserror::Error;

use crate::engine::EngineError;
use crate::model::StoreError;

pub mod conversation;
pub mod dispatcher;
pub mod memory;
pub mod messaging;
pub mod registration;

pub use conversation::{ConversationContext, ConversationHandle};
pub use dispatcher::AssistantDispatcher;
pub use memory::InMemoryMessaging;
pub use messaging::{Feed, FeedEvent, FeedMember, FeedMessage, Messaging, MessagingError};

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}
