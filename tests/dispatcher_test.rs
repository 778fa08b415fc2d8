mod common;

use std::sync::Arc;

use almond_cloud::apps::App;
use almond_cloud::assistant::conversation::{ENGINE_DIED, WELCOME};
use almond_cloud::assistant::memory::Outgoing;
use almond_cloud::assistant::{FeedMessage, InMemoryMessaging};
use almond_cloud::model::{InMemoryUserStore, TenantRecord, UserStore};
use serde_json::json;

use common::{mock_config, user, wait_until};

struct Cloud {
    app: App,
    messaging: Arc<InMemoryMessaging>,
    store: Arc<InMemoryUserStore>,
    _dir: tempfile::TempDir,
}

async fn cloud(users: Vec<TenantRecord>, feeds: &[(&str, &str)]) -> Cloud {
    let dir = tempfile::tempdir().unwrap();
    let messaging = Arc::new(InMemoryMessaging::new("almond"));
    for (feed_id, account) in feeds {
        messaging.insert_feed(feed_id, &[account]);
    }
    let store = Arc::new(InMemoryUserStore::with_users(users));
    let mut app = App::new();
    app.bootstrap(mock_config(dir.path(), 1, &[]), store.clone(), messaging.clone())
        .await
        .unwrap();
    Cloud { app, messaging, store, _dir: dir }
}

fn text(body: &str) -> FeedMessage {
    FeedMessage::Text { sender: "someone".into(), text: body.into(), hidden: false }
}

fn hidden(body: serde_json::Value) -> FeedMessage {
    FeedMessage::Text { sender: "someone".into(), text: body.to_string(), hidden: true }
}

fn has_text(messaging: &InMemoryMessaging, feed_id: &str, expected: &str) -> bool {
    messaging.sent(feed_id).iter().any(|m| m.as_text() == Some(expected))
}

#[tokio::test]
async fn messages_reach_the_users_engine() {
    let c = cloud(vec![user(1, Some("alice"), None)], &[("f-alice", "alice")]).await;
    let dispatcher = c.app.dispatcher().unwrap();
    assert_eq!(dispatcher.get_all_feeds(), vec!["f-alice"]);

    c.messaging.deliver("f-alice", text("turn on the lights")).unwrap();
    wait_until("echo", || has_text(&c.messaging, "f-alice", "echo: turn on the lights")).await;

    c.messaging.add_blob("h1", "https://blobs.test/h1");
    let picture = FeedMessage::Picture { sender: "alice".into(), full_size_hash: "h1".into() };
    c.messaging.deliver("f-alice", picture).unwrap();
    wait_until("picture answer", || {
        c.messaging
            .sent("f-alice")
            .iter()
            .any(|m| m.as_text().is_some_and(|t| t.starts_with("parsed:") && t.contains("https://blobs.test/h1")))
    })
    .await;
    c.app.shutdown().await;
}

#[tokio::test]
async fn a_dead_engine_is_reported_in_chat() {
    let c = cloud(vec![user(2, Some("bob"), Some("dev"))], &[("f-bob", "bob")]).await;
    let manager = c.app.manager().unwrap();
    manager.kill_user(2).await.unwrap();
    wait_until("engine to stop", || !manager.is_running(2)).await;

    c.messaging.deliver("f-bob", text("hello?")).unwrap();
    wait_until("died notice", || has_text(&c.messaging, "f-bob", ENGINE_DIED)).await;

    manager.start_user(2).await.unwrap();
    wait_until("engine to be attached", || c.app.dispatcher().unwrap().has_engine("bob")).await;
    c.messaging.deliver("f-bob", text("back?")).unwrap();
    wait_until("echo", || has_text(&c.messaging, "f-bob", "echo: back?")).await;
    c.app.shutdown().await;
}

#[tokio::test]
async fn new_contacts_register_through_chat() {
    let c = cloud(vec![], &[]).await;
    let feed_id = c.messaging.create_feed(&["carol"]);
    wait_until("welcome", || c.messaging.sent(&feed_id).first() == Some(&Outgoing::Text(WELCOME.into())))
        .await;

    c.messaging.deliver(&feed_id, text("hi")).unwrap();
    wait_until("pending notice", || {
        has_text(&c.messaging, &feed_id, "Sorry, you must complete the registration before you interact with Almond.")
    })
    .await;

    let mut form = json!({
        "op": "complete-registration",
        "username": "carol",
        "email": "carol.example.com",
        "password-hash": "a".repeat(64),
        "salt": "b".repeat(64),
    });
    c.messaging.deliver(&feed_id, hidden(form.clone())).unwrap();
    wait_until("validation error", || {
        has_text(&c.messaging, &feed_id, "Sorry that did not work: You must specify a valid email")
    })
    .await;
    assert!(c.store.is_empty());

    form["email"] = json!("carol@example.com");
    c.messaging.deliver(&feed_id, hidden(form)).unwrap();
    wait_until("engine for the new user", || c.app.dispatcher().unwrap().has_engine("carol")).await;
    let carol = c.store.get_by_username("carol").await.unwrap().unwrap();
    assert_eq!(carol.external_account_id.as_deref(), Some("carol"));
    assert!(c.app.manager().unwrap().is_running(carol.id));

    c.messaging.deliver(&feed_id, text("what can you do")).unwrap();
    wait_until("echo", || has_text(&c.messaging, &feed_id, "echo: what can you do")).await;
    c.app.shutdown().await;
}

#[tokio::test]
async fn deleted_users_leave_their_feeds() {
    let c = cloud(vec![user(4, Some("dave"), None)], &[("f-dave", "dave")]).await;
    let dispatcher = c.app.dispatcher().unwrap();
    assert!(dispatcher.conversation("f-dave").is_some());

    c.app.manager().unwrap().delete_user(4).await.unwrap();
    wait_until("feed to be left", || dispatcher.get_all_feeds().is_empty()).await;
    assert!(c.messaging.feed("f-dave").is_err());
    c.app.shutdown().await;
}
