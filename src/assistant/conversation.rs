//! One chat feed bound to one contact, and through it to a user's engine.
//!
//! Each conversation runs as a task that owns its state. Incoming feed
//! messages and engine changes are handled one at a time, in arrival order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_rpc::rpc::{arg, stub_ref};
use engine_rpc::{RemoteHandle, RpcError, RpcSocket, RpcStub};
use serde_json::{Value, json};
use strum::VariantNames;
use strum_macros::{EnumString, VariantNames};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::AssistantError;
use super::messaging::{Feed, FeedMember, FeedMessage, Messaging, MessagingError};
use super::registration;
use crate::engine::{EngineDirectory, EngineHandle};
use crate::model::UserStore;

pub const ENGINE_DIED: &str = "Sorry, your Almond died. It will not answer your messages until you restart it.";
pub const REGISTRATION_PENDING: &str = "Sorry, you must complete the registration before you interact with Almond.";
pub const WELCOME: &str = "Welcome to Almond!";
pub const REGISTRATION_REQUIRED: &str = "You must complete the registration before continuing";

/// Collaborators shared by every conversation.
pub struct ConversationContext {
    pub messaging: Arc<dyn Messaging>,
    pub store: Arc<dyn UserStore>,
    pub engines: Arc<dyn EngineDirectory>,
    /// Public origin used for links in cards.
    pub origin: String,
    pub picture_poll_interval: Duration,
    pub picture_poll_attempts: u32,
}

impl ConversationContext {
    fn link(&self, path: &str) -> String {
        if !path.starts_with('/') {
            return path.to_string();
        }
        match Url::parse(&self.origin).and_then(|origin| origin.join(path)) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}{}", self.origin.trim_end_matches('/'), path),
        }
    }
}

fn rdl(noun: &str, title: &str, text: Option<&str>, url: &str) -> Value {
    let mut card = json!({
        "type": "rdl",
        "noun": noun,
        "displayTitle": title,
        "callback": url,
        "webCallback": url,
    });
    if let Some(text) = text {
        card["displayText"] = json!(text);
    }
    card
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, VariantNames)]
#[strum(serialize_all = "camelCase")]
enum DelegateMethod {
    Send,
    SendPicture,
    #[strum(serialize = "sendRDL")]
    SendRdl,
    SendChoice,
    SendButton,
    SendLink,
}

/// What the engine's conversation may call back on.
struct ConversationDelegate {
    feed: Arc<dyn Feed>,
    ctx: Arc<ConversationContext>,
}

fn provider_error(err: MessagingError) -> RpcError {
    RpcError::Remote(err.to_string())
}

#[async_trait]
impl RpcStub for ConversationDelegate {
    fn methods(&self) -> &'static [&'static str] {
        DelegateMethod::VARIANTS
    }

    async fn invoke(&self, _: &RpcSocket, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let method: DelegateMethod = method
            .parse()
            .map_err(|_| RpcError::InvalidArguments(format!("unknown method {method}")))?;
        let sent = match method {
            DelegateMethod::Send => self.feed.send_text(&arg::<String>(&args, 0)?).await,
            DelegateMethod::SendPicture => self.feed.send_picture(&arg::<String>(&args, 0)?).await,
            DelegateMethod::SendRdl => self.feed.send_raw(arg::<Value>(&args, 0)?).await,
            DelegateMethod::SendChoice => {
                let idx: i64 = arg(&args, 0)?;
                let what: String = arg(&args, 1)?;
                let title: String = arg(&args, 2)?;
                let text: Option<String> = arg(&args, 3).unwrap_or(None);
                let url = self.ctx.link(&format!("/assistant/choice#{idx}"));
                self.feed.send_raw(rdl(&what, &title, text.as_deref(), &url)).await
            }
            DelegateMethod::SendButton => {
                let text: String = arg(&args, 0)?;
                let payload: String = arg(&args, 1)?;
                let encoded: String = url::form_urlencoded::byte_serialize(payload.as_bytes()).collect();
                let url = self.ctx.link(&format!("/assistant/echo#{encoded}"));
                self.feed.send_raw(rdl("button", &text, None, &url)).await
            }
            DelegateMethod::SendLink => {
                let title: String = arg(&args, 0)?;
                let url = self.ctx.link(&arg::<String>(&args, 1)?);
                self.feed.send_raw(rdl("link", &title, None, &url)).await
            }
        };
        sent.map(|_| Value::Null).map_err(provider_error)
    }
}

enum Command {
    SetEngine(Option<EngineHandle>),
}

struct Conversation {
    ctx: Arc<ConversationContext>,
    feed: Arc<dyn Feed>,
    member: FeedMember,
    user_id: Option<i64>,
    engine: Option<EngineHandle>,
    remote: Option<RemoteHandle>,
    delegate: Option<(RpcSocket, u64)>,
    had_engine: bool,
    registering: bool,
}

impl Conversation {
    fn feed_id(&self) -> &str {
        self.feed.feed_id()
    }

    async fn send(&self, text: &str) {
        if let Err(err) = self.feed.send_text(text).await {
            warn!(feed_id = self.feed_id(), error = %err, "failed to send message");
        }
    }

    async fn start_registration(&mut self) -> Result<(), MessagingError> {
        info!(feed_id = self.feed_id(), account = %self.member.account, "starting registration");
        self.registering = true;
        self.feed.send_text(WELCOME).await?;
        self.feed.send_text(REGISTRATION_REQUIRED).await?;
        let url = self.ctx.link("/user/register");
        let card = rdl("app", "Complete registration", Some("Click here to set up username and password"), &url);
        self.feed.send_raw(card).await
    }

    fn drop_remote(&mut self) {
        self.remote = None;
        if let Some((socket, id)) = self.delegate.take() {
            socket.free_stub(id);
        }
    }

    async fn open_remote(&mut self, engine: &EngineHandle) -> Result<RemoteHandle, RpcError> {
        self.drop_remote();
        let socket = engine.assistant.socket().clone();
        let delegate = Arc::new(ConversationDelegate { feed: Arc::clone(&self.feed), ctx: Arc::clone(&self.ctx) });
        let id = socket.add_stub(delegate);
        self.delegate = Some((socket, id));

        let user = json!({ "account": self.member.account, "name": self.member.name });
        let opened = engine
            .assistant
            .call_handle("openConversation", vec![json!(self.feed_id()), user, stub_ref(id)])
            .await;
        let remote = match opened {
            Ok(remote) => remote,
            Err(err) => {
                self.drop_remote();
                return Err(err);
            }
        };
        if let Err(err) = remote.call("start", vec![]).await {
            self.drop_remote();
            return Err(err);
        }

        self.had_engine = true;
        self.engine = Some(engine.clone());
        self.remote = Some(remote.clone());
        Ok(remote)
    }

    async fn try_get_remote(&mut self) -> Option<RemoteHandle> {
        if let Some(remote) = &self.remote {
            return Some(remote.clone());
        }
        if self.user_id.is_none() {
            self.user_id = self.lookup_user().await;
        }
        let engine = match &self.engine {
            Some(engine) => engine.clone(),
            None => match self.ctx.engines.get_engine(self.user_id?) {
                Ok(engine) => engine,
                Err(err) => {
                    if !err.is_not_running() {
                        warn!(feed_id = self.feed_id(), error = %err, "failed to look up engine");
                    }
                    return None;
                }
            },
        };
        match self.open_remote(&engine).await {
            Ok(remote) => Some(remote),
            Err(err) => {
                warn!(feed_id = self.feed_id(), error = %err, "failed to open remote conversation");
                None
            }
        }
    }

    // the contact may have registered since the conversation started
    async fn lookup_user(&self) -> Option<i64> {
        match self.ctx.store.get_by_account(&self.member.account).await {
            Ok(user) => user.map(|u| u.id),
            Err(err) => {
                warn!(feed_id = self.feed_id(), error = %err, "failed to look up user");
                None
            }
        }
    }

    /// Calls the remote conversation, treating a closed socket as a dead
    /// engine.
    async fn call_remote(&mut self, method: &str, payload: Value) {
        let Some(remote) = self.try_get_remote().await else {
            return self.handle_no_engine().await;
        };
        match remote.call(method, vec![payload]).await {
            Ok(_) => {}
            Err(RpcError::Closed) => {
                debug!(feed_id = self.feed_id(), method, "engine went away");
                self.drop_remote();
                self.engine = None;
                self.handle_no_engine().await;
            }
            Err(err) => warn!(feed_id = self.feed_id(), method, error = %err, "assistant call failed"),
        }
    }

    async fn set_engine(&mut self, engine: Option<EngineHandle>) {
        self.drop_remote();
        self.registering = false;
        self.engine = engine.clone();
        if let Some(engine) = engine {
            if let Err(err) = self.open_remote(&engine).await {
                warn!(feed_id = self.feed_id(), error = %err, "failed to start conversation with new engine");
            }
        }
    }

    async fn handle_no_engine(&mut self) {
        if self.had_engine {
            self.send(ENGINE_DIED).await;
        } else if self.registering {
            self.send(REGISTRATION_PENDING).await;
        } else if let Err(err) = self.start_registration().await {
            warn!(feed_id = self.feed_id(), error = %err, "failed to start registration");
        }
    }

    async fn on_new_message(&mut self, msg: FeedMessage) {
        match msg {
            FeedMessage::Text { text, hidden: true, .. } => self.on_hidden_message(&text).await,
            FeedMessage::Text { text, .. } => self.on_text_message(&text).await,
            FeedMessage::Picture { full_size_hash, .. } => self.on_picture(&full_size_hash).await,
        }
    }

    async fn on_text_message(&mut self, text: &str) {
        self.call_remote("handleCommand", json!(text)).await;
    }

    // hidden messages carry registration results and pre-parsed commands
    async fn on_hidden_message(&mut self, text: &str) {
        let parsed: Value = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(feed_id = self.feed_id(), error = %err, "hidden message is not JSON");
                return;
            }
        };

        let op = parsed.get("op").and_then(Value::as_str);
        if self.registering && op == Some("complete-registration") {
            let store = Arc::clone(&self.ctx.store);
            let engines = Arc::clone(&self.ctx.engines);
            let registered = registration::register(&parsed, &self.member.account, &*store, &*engines).await;
            match registered {
                Ok(user) => self.user_id = Some(user.id),
                Err(err) => self.send(&format!("Sorry that did not work: {err}")).await,
            }
            return;
        }
        if parsed.get("op").is_some() {
            return;
        }

        self.call_remote("handleParsedCommand", json!(text)).await;
    }

    async fn on_picture(&mut self, hash: &str) {
        let mut url = None;
        for _ in 0..self.ctx.picture_poll_attempts {
            match self.ctx.messaging.download_link(hash).await {
                Ok(Some(link)) => {
                    url = Some(link);
                    break;
                }
                Ok(None) => tokio::time::sleep(self.ctx.picture_poll_interval).await,
                Err(err) => {
                    warn!(feed_id = self.feed_id(), error = %err, "failed to get download link for picture");
                    return;
                }
            }
        }
        let Some(url) = url else {
            warn!(feed_id = self.feed_id(), hash, "picture never became available");
            return;
        };

        let answer = json!({ "answer": { "type": "Picture", "value": { "value": url } } });
        self.call_remote("handleParsedCommand", json!(answer.to_string())).await;
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut incoming: broadcast::Receiver<FeedMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(Command::SetEngine(engine)) => self.set_engine(engine).await,
                    None => break,
                },
                msg = incoming.recv() => match msg {
                    Ok(msg) => self.on_new_message(msg).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(feed_id = self.feed_id(), skipped, "conversation fell behind its feed");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        self.drop_remote();
        debug!(feed_id = self.feed_id(), "conversation stopped");
    }
}

/// A running conversation.
pub struct ConversationHandle {
    feed: Arc<dyn Feed>,
    account: String,
    ctx: Arc<ConversationContext>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConversationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationHandle")
            .field("feed_id", &self.feed_id())
            .field("account", &self.account)
            .finish()
    }
}

impl ConversationHandle {
    /// Starts a conversation on `feed` with `member`.
    ///
    /// With an engine, or a known user, the remote conversation is opened
    /// right away. Otherwise a new feed starts the registration flow.
    pub async fn start(
        ctx: Arc<ConversationContext>,
        feed: Arc<dyn Feed>,
        member: FeedMember,
        engine: Option<EngineHandle>,
        user_id: Option<i64>,
        new_feed: bool,
    ) -> Result<Arc<Self>, AssistantError> {
        let mut conv = Conversation {
            ctx: Arc::clone(&ctx),
            feed: Arc::clone(&feed),
            member: member.clone(),
            user_id,
            engine: engine.clone(),
            remote: None,
            delegate: None,
            had_engine: engine.is_some() || user_id.is_some(),
            registering: false,
        };

        let incoming = feed.incoming();
        if conv.had_engine {
            // a missing engine is reported on the first message
            conv.try_get_remote().await;
        } else if new_feed {
            conv.start_registration().await?;
        }
        feed.open().await?;

        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(conv.run(rx, incoming, cancel.clone()));

        Ok(Arc::new(Self { feed, account: member.account, ctx, commands, cancel }))
    }

    pub fn feed_id(&self) -> &str {
        self.feed.feed_id()
    }

    /// Counterparty account of the feed.
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Rebinds to a new engine, or detaches with `None`.
    pub fn set_engine(&self, engine: Option<EngineHandle>) {
        let _ = self.commands.send(Command::SetEngine(engine));
    }

    pub async fn stop(&self) -> Result<(), MessagingError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.cancel.cancel();
        self.feed.close().await
    }

    /// Leaves the feed; the provider then reports it removed.
    pub async fn destroy(&self) -> Result<(), MessagingError> {
        self.ctx.messaging.leave_feed(self.feed_id()).await
    }
}
