//! Maps chat feeds to conversations and conversations to engines.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::AssistantError;
use super::conversation::{ConversationContext, ConversationHandle};
use super::messaging::{Feed, FeedEvent, FeedMember};
use crate::engine::{ChatDispatcher, EngineHandle};
use crate::util::lock_unpoisoned;

// a conversation being debounced, or running
struct Slot {
    id: u64,
    account: String,
    cancel: CancellationToken,
    conversation: Option<Arc<ConversationHandle>>,
}

pub struct AssistantDispatcher {
    ctx: Arc<ConversationContext>,
    conversation_delay: Duration,
    engines: DashMap<String, EngineHandle>,
    conversations: DashMap<String, Slot>,
    initial_feeds: Mutex<HashSet<String>>,
    next_slot: AtomicU64,
    listener: Mutex<Option<CancellationToken>>,
    me: Weak<AssistantDispatcher>,
}

impl std::fmt::Debug for AssistantDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantDispatcher")
            .field("engines", &self.engines.len())
            .field("conversations", &self.conversations.len())
            .finish()
    }
}

impl AssistantDispatcher {
    pub fn new(ctx: Arc<ConversationContext>, conversation_delay: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            ctx,
            conversation_delay,
            engines: DashMap::new(),
            conversations: DashMap::new(),
            initial_feeds: Mutex::new(HashSet::new()),
            next_slot: AtomicU64::new(1),
            listener: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Subscribes to feed events and opens conversations on every existing
    /// feed.
    pub async fn start(&self) -> Result<(), AssistantError> {
        self.ctx.messaging.start().await?;
        let mut events = self.ctx.messaging.events();
        let feeds = self.ctx.messaging.feed_list().await?;

        let cancel = CancellationToken::new();
        if let Some(previous) = lock_unpoisoned(&self.listener).replace(cancel.clone()) {
            previous.cancel();
        }
        let dispatcher = self.me.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => match dispatcher.upgrade() {
                        Some(dispatcher) => dispatcher.on_feed_event(event),
                        None => return,
                    },
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed feed events"),
                    Err(RecvError::Closed) => return,
                }
            }
        });

        info!(count = feeds.len(), "opening conversations on existing feeds");
        lock_unpoisoned(&self.initial_feeds).extend(feeds.iter().cloned());
        let results = join_all(feeds.iter().map(|feed_id| self.make_conversation(feed_id, false))).await;
        for (feed_id, result) in feeds.iter().zip(results) {
            if let Err(err) = result {
                error!(feed_id = %feed_id, error = %err, "failed to open conversation");
            }
        }
        Ok(())
    }

    /// Unsubscribes from feed events and stops every conversation.
    pub async fn stop(&self) {
        if let Some(listener) = lock_unpoisoned(&self.listener).take() {
            listener.cancel();
        }
        if let Err(err) = self.ctx.messaging.stop().await {
            warn!(error = %err, "failed to stop messaging");
        }

        let feed_ids: Vec<String> = self.conversations.iter().map(|s| s.key().clone()).collect();
        let slots: Vec<Slot> = feed_ids
            .into_iter()
            .filter_map(|id| self.conversations.remove(&id).map(|(_, slot)| slot))
            .collect();
        join_all(slots.into_iter().map(stop_slot)).await;
    }

    fn on_feed_event(self: Arc<Self>, event: FeedEvent) {
        debug!(?event, "feed event");
        match event {
            FeedEvent::Added(feed_id) => self.spawn_make_conversation(feed_id, true),
            FeedEvent::Changed(feed_id) => {
                if self.conversations.contains_key(&feed_id) {
                    return;
                }
                let new_feed = !lock_unpoisoned(&self.initial_feeds).contains(&feed_id);
                self.spawn_make_conversation(feed_id, new_feed);
            }
            FeedEvent::Removed(feed_id) => {
                if let Some((_, slot)) = self.conversations.remove(&feed_id) {
                    tokio::spawn(stop_slot(slot));
                }
            }
        }
    }

    fn spawn_make_conversation(self: Arc<Self>, feed_id: String, new_feed: bool) {
        tokio::spawn(async move {
            if let Err(err) = self.make_conversation(&feed_id, new_feed).await {
                error!(feed_id = %feed_id, error = %err, "failed to open conversation");
            }
        });
    }

    /// Opens the feed and decides what to do with it: 1:1 feeds get a
    /// conversation, anything else is rejected.
    pub async fn make_conversation(&self, feed_id: &str, new_feed: bool) -> Result<(), AssistantError> {
        let feed = self.ctx.messaging.get_feed(feed_id);
        feed.open().await?;
        let result = self.make_conversation_on(&feed, new_feed).await;
        if let Err(err) = feed.close().await {
            warn!(feed_id, error = %err, "failed to close feed");
        }
        result
    }

    async fn make_conversation_on(&self, feed: &Arc<dyn Feed>, new_feed: bool) -> Result<(), AssistantError> {
        let feed_id = feed.feed_id();
        let members = feed.members().await?;
        if members.len() < 2 {
            info!(feed_id, "ignored feed");
            self.reject_conversation(feed_id).await;
            return Ok(());
        }
        if members.len() >= 3 {
            info!(feed_id, members = members.len(), "rejected group feed");
            self.reject_conversation(feed_id).await;
            return Ok(());
        }
        if self.conversations.contains_key(feed_id) {
            return Ok(());
        }

        let member = members[1].clone();
        info!(feed_id, account = %member.account, "found conversation");
        let engine = self.engines.get(&member.account).map(|e| e.value().clone());
        let user_id = match &engine {
            Some(_) => None,
            None => self.ctx.store.get_by_account(&member.account).await?.map(|u| u.id),
        };
        let new_feed = new_feed && engine.is_none() && user_id.is_none();
        self.make_conversation_for_account(feed, member, engine, user_id, new_feed).await
    }

    async fn make_conversation_for_account(
        &self,
        feed: &Arc<dyn Feed>,
        member: FeedMember,
        engine: Option<EngineHandle>,
        user_id: Option<i64>,
        new_feed: bool,
    ) -> Result<(), AssistantError> {
        let feed_id = feed.feed_id().to_string();
        let had_engine = engine.is_some();
        let id = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        match self.conversations.entry(feed_id.clone()) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(Slot { id, account: member.account.clone(), cancel: cancel.clone(), conversation: None });
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.conversation_delay) => {}
        }

        let started = ConversationHandle::start(
            Arc::clone(&self.ctx),
            Arc::clone(feed),
            member,
            engine,
            user_id,
            new_feed,
        )
        .await;
        let conversation = match started {
            Ok(conversation) => conversation,
            Err(err) => {
                self.conversations.remove_if(&feed_id, |_, slot| slot.id == id);
                return Err(err);
            }
        };

        let mut installed = false;
        if let Some(mut slot) = self.conversations.get_mut(&feed_id) {
            if slot.id == id && !slot.cancel.is_cancelled() {
                slot.conversation = Some(Arc::clone(&conversation));
                installed = true;
            }
        }
        if !installed {
            // rejected or removed while starting
            let _ = conversation.stop().await;
            return Ok(());
        }

        // the engine may have been added while the conversation was starting
        if !had_engine {
            if let Some(engine) = self.engines.get(conversation.account()).map(|e| e.value().clone()) {
                conversation.set_engine(Some(engine));
            }
        }
        Ok(())
    }

    async fn reject_conversation(&self, feed_id: &str) {
        if let Some((_, slot)) = self.conversations.remove(feed_id) {
            stop_slot(slot).await;
        }
    }

    fn conversations_of(&self, account: &str) -> Vec<Arc<ConversationHandle>> {
        self.conversations
            .iter()
            .filter(|s| s.account == account)
            .filter_map(|s| s.conversation.clone())
            .collect()
    }

    pub fn conversation(&self, feed_id: &str) -> Option<Arc<ConversationHandle>> {
        self.conversations.get(feed_id).and_then(|s| s.conversation.clone())
    }

    /// Ids of the feeds with a running conversation.
    pub fn get_all_feeds(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .conversations
            .iter()
            .filter(|s| s.conversation.is_some())
            .map(|s| s.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Makes sure `account` is a contact and has a 1:1 feed with us. The
    /// feed then comes back through the feed events.
    pub async fn get_or_create_feed_for_user(&self, account: &str) -> Result<String, AssistantError> {
        self.ctx.messaging.add_account_to_contacts(account).await?;
        let feed = self.ctx.messaging.get_feed_with_contact(account).await?;
        Ok(feed.feed_id().to_string())
    }

    pub fn has_engine(&self, account: &str) -> bool {
        self.engines.contains_key(account)
    }
}

async fn stop_slot(slot: Slot) {
    slot.cancel.cancel();
    if let Some(conversation) = slot.conversation {
        if let Err(err) = conversation.stop().await {
            warn!(feed_id = conversation.feed_id(), error = %err, "failed to stop conversation");
        }
    }
}

impl ChatDispatcher for AssistantDispatcher {
    fn add_engine(&self, account: &str, engine: EngineHandle) {
        self.engines.insert(account.to_string(), engine.clone());
        for conversation in self.conversations_of(account) {
            conversation.set_engine(Some(engine.clone()));
        }
    }

    fn remove_engine(&self, account: &str) {
        self.engines.remove(account);
        for conversation in self.conversations_of(account) {
            conversation.set_engine(None);
        }
    }

    fn remove_all_engines(&self) {
        self.engines.clear();
    }

    fn delete_user(&self, account: &str) {
        for conversation in self.conversations_of(account) {
            tokio::spawn(async move {
                // stopping happens when the provider reports the feed removed
                if let Err(err) = conversation.destroy().await {
                    error!(feed_id = conversation.feed_id(), error = %err, "failed to destroy conversation");
                }
            });
        }
    }
}
