//! The external chat service as the dispatcher sees it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("feed {0} does not exist")]
    FeedNotFound(String),
    #[error("messaging provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMember {
    pub account: String,
    pub name: Option<String>,
}

impl FeedMember {
    pub fn new(account: &str) -> Self {
        Self { account: account.to_string(), name: None }
    }
}

/// A message posted to a feed by somebody other than us.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Text { sender: String, text: String, hidden: bool },
    Picture { sender: String, full_size_hash: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Added(String),
    Changed(String),
    Removed(String),
}

impl FeedEvent {
    pub fn feed_id(&self) -> &str {
        match self {
            FeedEvent::Added(id) | FeedEvent::Changed(id) | FeedEvent::Removed(id) => id,
        }
    }
}

/// One chat thread.
#[async_trait]
pub trait Feed: Send + Sync {
    fn feed_id(&self) -> &str;

    /// Feeds are reference counted; every `open` is paired with a `close`.
    async fn open(&self) -> Result<(), MessagingError>;
    async fn close(&self) -> Result<(), MessagingError>;

    /// Members of the feed, starting with our own account.
    async fn members(&self) -> Result<Vec<FeedMember>, MessagingError>;

    /// Incoming messages, excluding the ones we send.
    fn incoming(&self) -> broadcast::Receiver<FeedMessage>;

    async fn send_text(&self, text: &str) -> Result<(), MessagingError>;
    async fn send_picture(&self, url: &str) -> Result<(), MessagingError>;
    /// Sends a provider specific item such as an RDL card.
    async fn send_raw(&self, item: Value) -> Result<(), MessagingError>;
}

#[async_trait]
pub trait Messaging: Send + Sync {
    async fn start(&self) -> Result<(), MessagingError>;
    async fn stop(&self) -> Result<(), MessagingError>;

    fn events(&self) -> broadcast::Receiver<FeedEvent>;
    async fn feed_list(&self) -> Result<Vec<String>, MessagingError>;
    fn get_feed(&self, feed_id: &str) -> Arc<dyn Feed>;

    async fn add_account_to_contacts(&self, account: &str) -> Result<(), MessagingError>;
    /// Returns the 1:1 feed with `account`, creating it if needed.
    async fn get_feed_with_contact(&self, account: &str) -> Result<Arc<dyn Feed>, MessagingError>;
    async fn leave_feed(&self, feed_id: &str) -> Result<(), MessagingError>;

    /// Download URL of an uploaded blob, or `None` while it is still being
    /// ingested.
    async fn download_link(&self, hash: &str) -> Result<Option<String>, MessagingError>;
}
