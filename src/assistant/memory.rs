//! Messaging provider kept entirely in memory.
//!
//! Used when no external chat service is configured, and by tests to play
//! the part of the remote contacts.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::messaging::{Feed, FeedEvent, FeedMember, FeedMessage, Messaging, MessagingError};
use crate::util::lock_unpoisoned;

/// Something we posted to a feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    Picture(String),
    Raw(Value),
}

impl Outgoing {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Outgoing::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct MemoryFeed {
    feed_id: String,
    members: Mutex<Vec<FeedMember>>,
    incoming: broadcast::Sender<FeedMessage>,
    outgoing: Mutex<Vec<Outgoing>>,
    open_count: AtomicUsize,
}

impl MemoryFeed {
    fn new(feed_id: String, members: Vec<FeedMember>) -> Self {
        let (incoming, _) = broadcast::channel(256);
        Self {
            feed_id,
            members: Mutex::new(members),
            incoming,
            outgoing: Mutex::new(Vec::new()),
            open_count: AtomicUsize::new(0),
        }
    }

    pub fn sent(&self) -> Vec<Outgoing> {
        lock_unpoisoned(&self.outgoing).clone()
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    fn push(&self, item: Outgoing) {
        lock_unpoisoned(&self.outgoing).push(item);
    }
}

#[async_trait]
impl Feed for MemoryFeed {
    fn feed_id(&self) -> &str {
        &self.feed_id
    }

    async fn open(&self) -> Result<(), MessagingError> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let _ = self
            .open_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        Ok(())
    }

    async fn members(&self) -> Result<Vec<FeedMember>, MessagingError> {
        Ok(lock_unpoisoned(&self.members).clone())
    }

    fn incoming(&self) -> broadcast::Receiver<FeedMessage> {
        self.incoming.subscribe()
    }

    async fn send_text(&self, text: &str) -> Result<(), MessagingError> {
        self.push(Outgoing::Text(text.to_string()));
        Ok(())
    }

    async fn send_picture(&self, url: &str) -> Result<(), MessagingError> {
        self.push(Outgoing::Picture(url.to_string()));
        Ok(())
    }

    async fn send_raw(&self, item: Value) -> Result<(), MessagingError> {
        self.push(Outgoing::Raw(item));
        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemoryMessaging {
    own_account: String,
    feeds: DashMap<String, Arc<MemoryFeed>>,
    contacts: Mutex<BTreeSet<String>>,
    blobs: DashMap<String, String>,
    events: broadcast::Sender<FeedEvent>,
    next_feed: AtomicU64,
}

impl InMemoryMessaging {
    pub fn new(own_account: &str) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            own_account: own_account.to_string(),
            feeds: DashMap::new(),
            contacts: Mutex::new(BTreeSet::new()),
            blobs: DashMap::new(),
            events,
            next_feed: AtomicU64::new(1),
        }
    }

    pub fn own_account(&self) -> &str {
        &self.own_account
    }

    fn emit(&self, event: FeedEvent) {
        debug!(?event, "feed event");
        let _ = self.events.send(event);
    }

    /// Creates a feed with us and `others` as members.
    pub fn create_feed(&self, others: &[&str]) -> String {
        let id = format!("feed-{}", self.next_feed.fetch_add(1, Ordering::SeqCst));
        self.insert_feed(&id, others);
        self.emit(FeedEvent::Added(id.clone()));
        id
    }

    /// Seeds a feed without announcing it, as if it existed before start.
    pub fn insert_feed(&self, feed_id: &str, others: &[&str]) {
        let mut members = vec![FeedMember::new(&self.own_account)];
        members.extend(others.iter().map(|a| FeedMember::new(a)));
        self.feeds.insert(feed_id.to_string(), Arc::new(MemoryFeed::new(feed_id.to_string(), members)));
    }

    pub fn set_members(&self, feed_id: &str, others: &[&str]) -> Result<(), MessagingError> {
        let feed = self.feed(feed_id)?;
        let mut members = vec![FeedMember::new(&self.own_account)];
        members.extend(others.iter().map(|a| FeedMember::new(a)));
        *lock_unpoisoned(&feed.members) = members;
        self.emit(FeedEvent::Changed(feed_id.to_string()));
        Ok(())
    }

    pub fn remove_feed(&self, feed_id: &str) {
        if self.feeds.remove(feed_id).is_some() {
            self.emit(FeedEvent::Removed(feed_id.to_string()));
        }
    }

    /// Posts `message` to a feed as one of the other members.
    pub fn deliver(&self, feed_id: &str, message: FeedMessage) -> Result<(), MessagingError> {
        let feed = self.feed(feed_id)?;
        let _ = feed.incoming.send(message);
        Ok(())
    }

    pub fn add_blob(&self, hash: &str, url: &str) {
        self.blobs.insert(hash.to_string(), url.to_string());
    }

    pub fn feed(&self, feed_id: &str) -> Result<Arc<MemoryFeed>, MessagingError> {
        self.feeds
            .get(feed_id)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| MessagingError::FeedNotFound(feed_id.to_string()))
    }

    pub fn sent(&self, feed_id: &str) -> Vec<Outgoing> {
        self.feed(feed_id).map(|f| f.sent()).unwrap_or_default()
    }

    pub fn contacts(&self) -> Vec<String> {
        lock_unpoisoned(&self.contacts).iter().cloned().collect()
    }
}

#[async_trait]
impl Messaging for InMemoryMessaging {
    async fn start(&self) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), MessagingError> {
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    async fn feed_list(&self) -> Result<Vec<String>, MessagingError> {
        let mut ids: Vec<String> = self.feeds.iter().map(|f| f.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    fn get_feed(&self, feed_id: &str) -> Arc<dyn Feed> {
        let feed = self
            .feeds
            .entry(feed_id.to_string())
            .or_insert_with(|| Arc::new(MemoryFeed::new(feed_id.to_string(), Vec::new())));
        Arc::clone(feed.value()) as Arc<dyn Feed>
    }

    async fn add_account_to_contacts(&self, account: &str) -> Result<(), MessagingError> {
        lock_unpoisoned(&self.contacts).insert(account.to_string());
        Ok(())
    }

    async fn get_feed_with_contact(&self, account: &str) -> Result<Arc<dyn Feed>, MessagingError> {
        let existing = self.feeds.iter().find_map(|f| {
            let members = lock_unpoisoned(&f.members);
            let one_to_one = members.len() == 2 && members[1].account == account;
            one_to_one.then(|| Arc::clone(f.value()))
        });
        if let Some(feed) = existing {
            debug!(feed_id = %feed.feed_id, account, "reusing feed");
            return Ok(feed);
        }
        let id = self.create_feed(&[account]);
        debug!(feed_id = %id, account, "created feed");
        Ok(self.feed(&id)? as Arc<dyn Feed>)
    }

    async fn leave_feed(&self, feed_id: &str) -> Result<(), MessagingError> {
        self.feed(feed_id)?;
        self.remove_feed(feed_id);
        Ok(())
    }

    async fn download_link(&self, hash: &str) -> Result<Option<String>, MessagingError> {
        Ok(self.blobs.get(hash).map(|u| u.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn feeds_announce_their_lifecycle() {
        let messaging = InMemoryMessaging::new("almond");
        let mut events = messaging.events();
        let id = messaging.create_feed(&["alice"]);
        messaging.set_members(&id, &["alice", "bob"]).unwrap();
        messaging.leave_feed(&id).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), FeedEvent::Added(id.clone()));
        assert_eq!(events.recv().await.unwrap(), FeedEvent::Changed(id.clone()));
        assert_eq!(events.recv().await.unwrap(), FeedEvent::Removed(id.clone()));
        assert!(messaging.feed_list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn contact_feeds_are_reused() {
        let messaging = InMemoryMessaging::new("almond");
        messaging.add_account_to_contacts("carol").await.unwrap();
        let a = messaging.get_feed_with_contact("carol").await.unwrap();
        let b = messaging.get_feed_with_contact("carol").await.unwrap();
        assert_eq!(a.feed_id(), b.feed_id());
        let members = a.members().await.unwrap();
        assert_eq!(members[0].account, "almond");
        assert_eq!(members[1].account, "carol");
        assert_eq!(messaging.contacts(), vec!["carol"]);
    }

    #[tokio::test]
    async fn outgoing_messages_are_recorded() {
        let messaging = InMemoryMessaging::new("almond");
        messaging.insert_feed("f", &["dave"]);
        let feed = messaging.get_feed("f");
        feed.open().await.unwrap();
        feed.send_text("hi").await.unwrap();
        feed.send_picture("http://x/p.png").await.unwrap();
        assert_eq!(
            messaging.sent("f"),
            vec![Outgoing::Text("hi".into()), Outgoing::Picture("http://x/p.png".into())]
        );
        assert_eq!(messaging.feed("f").unwrap().open_count(), 1);
        assert!(messaging.download_link("nope").await.unwrap().is_none());
    }
}
