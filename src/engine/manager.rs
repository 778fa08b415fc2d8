//! Keeps one engine running per user, on a shared or a dedicated process.
//!
//! Users without a developer key share a fixed pool of processes picked
//! round-robin; everybody else gets a process of their own. The manager
//! notices when an engine goes away, unhooks it from the webhook, websocket
//! and chat routers, and restarts engines that were lost to a crash of a
//! shared process.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use engine_rpc::rpc::stub_ref;
use engine_rpc::{ControlMessage, RemoteHandle};
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::process::{EngineProcess, ProcessEvent, ProcessState};
use super::{ChatDispatcher, EngineDirectory, EngineError, EngineHandle, websocket_path};
use crate::config::EngineConfig;
use crate::frontend::{UpgradeHandler, UpgradeRequest, WebSocketRegistry};
use crate::model::{TenantRecord, UserStore};
use crate::thingpedia::ThingpediaClient;
use crate::util::lock_unpoisoned;
use crate::webhook::WebhookDispatcher;

#[derive(Debug, Default)]
struct SharedPool {
    processes: Mutex<Vec<Arc<EngineProcess>>>,
    next: AtomicUsize,
}

impl SharedPool {
    fn set(&self, processes: Vec<Arc<EngineProcess>>) {
        *lock_unpoisoned(&self.processes) = processes;
        self.next.store(0, Ordering::SeqCst);
    }

    fn next_process(&self) -> Option<Arc<EngineProcess>> {
        let processes = lock_unpoisoned(&self.processes);
        let len = processes.len();
        if len == 0 {
            return None;
        }
        let n = self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n + 1) % len))
            .unwrap_or_else(|n| n);
        Some(Arc::clone(&processes[n % len]))
    }

    fn all(&self) -> Vec<Arc<EngineProcess>> {
        lock_unpoisoned(&self.processes).clone()
    }
}

// one run of one user's engine
#[derive(Debug)]
struct UserEntry {
    user_id: i64,
    cloud_id: String,
    account: Mutex<Option<String>>,
    process: Mutex<Option<Arc<EngineProcess>>>,
    engine: Mutex<Option<EngineHandle>>,
    thingpedia_stub: Mutex<Option<u64>>,
    dead: AtomicBool,
    cancel: CancellationToken,
}

impl UserEntry {
    fn new(user: &TenantRecord) -> Self {
        Self {
            user_id: user.id,
            cloud_id: user.cloud_id.clone(),
            account: Mutex::new(user.external_account_id.clone()),
            process: Mutex::new(None),
            engine: Mutex::new(None),
            thingpedia_stub: Mutex::new(None),
            dead: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

pub struct EngineManager {
    config: EngineConfig,
    store: Arc<dyn UserStore>,
    webhooks: Arc<WebhookDispatcher>,
    frontend: Arc<dyn WebSocketRegistry>,
    chat: OnceLock<Weak<dyn ChatDispatcher>>,
    pool: SharedPool,
    processes: DashMap<String, Arc<EngineProcess>>,
    engines: DashMap<i64, Arc<UserEntry>>,
    running: AtomicBool,
    me: Weak<EngineManager>,
}

impl std::fmt::Debug for EngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineManager")
            .field("running", &self.is_started())
            .field("engines", &self.engines.len())
            .field("processes", &self.processes.len())
            .finish()
    }
}

impl EngineManager {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn UserStore>,
        webhooks: Arc<WebhookDispatcher>,
        frontend: Arc<dyn WebSocketRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            store,
            webhooks,
            frontend,
            chat: OnceLock::new(),
            pool: SharedPool::default(),
            processes: DashMap::new(),
            engines: DashMap::new(),
            running: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Connects the chat side. Only the first dispatcher is kept.
    pub fn set_chat_dispatcher(&self, chat: &Arc<dyn ChatDispatcher>) {
        if self.chat.set(Arc::downgrade(chat)).is_err() {
            warn!("chat dispatcher already set");
        }
    }

    fn chat(&self) -> Option<Arc<dyn ChatDispatcher>> {
        self.chat.get().and_then(Weak::upgrade)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn webhooks(&self) -> &Arc<WebhookDispatcher> {
        &self.webhooks
    }

    pub fn is_started(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shared_processes(&self) -> Vec<Arc<EngineProcess>> {
        self.pool.all()
    }

    /// Picks the process that will host `user`'s engine.
    ///
    /// Users with a developer key or the separate-process flag always get a
    /// new dedicated process, started before this returns.
    pub async fn find_process_for_user(&self, user: &TenantRecord) -> Result<Arc<EngineProcess>, EngineError> {
        if self.config.enable_shared_process && user.developer_key.is_none() && !user.force_separate_process {
            if let Some(process) = self.pool.next_process() {
                process.wait_ready().await?;
                return Ok(process);
            }
        }

        let process = Arc::new(EngineProcess::dedicated(user.id, &user.cloud_id, &self.config));
        self.processes.insert(process.id().to_string(), Arc::clone(&process));
        self.spawn_reaper(&process);
        if let Err(err) = process.start().await {
            self.processes.remove_if(process.id(), |_, p| Arc::ptr_eq(p, &process));
            return Err(err);
        }
        Ok(process)
    }

    // forgets a dedicated process once its child exits
    fn spawn_reaper(&self, process: &Arc<EngineProcess>) {
        let mut events = process.subscribe();
        let watched = Arc::downgrade(process);
        let manager = self.me.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProcessEvent::Exit { .. }) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
            let (Some(manager), Some(process)) = (manager.upgrade(), watched.upgrade()) else { return };
            manager.processes.remove_if(process.id(), |_, p| Arc::ptr_eq(p, &process));
        });
    }

    // restarts a pool process whenever its child exits while we are running
    fn spawn_pool_keeper(&self, process: &Arc<EngineProcess>) {
        let mut events = process.subscribe();
        let watched = Arc::downgrade(process);
        let manager = self.me.clone();
        let delay = self.config.shared_restart_delay;
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProcessEvent::Exit { .. }) => {}
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
                let running = manager.upgrade().is_some_and(|m| m.is_started());
                let Some(process) = watched.upgrade() else { return };
                if !running {
                    continue;
                }
                warn!(process = process.id(), ?delay, "shared engine process died, restarting");
                if let Err(err) = process.restart(delay).await {
                    error!(process = process.id(), error = %err, "failed to restart shared engine process");
                }
            }
        });
    }

    async fn run_user(&self, user: TenantRecord) -> Result<(), EngineError> {
        let previous = self.engines.get(&user.id).map(|e| Arc::clone(e.value()));
        if let Some(previous) = previous {
            debug!(user_id = user.id, "replacing previous engine entry");
            let process = lock_unpoisoned(&previous.process).clone();
            self.die(&previous, true);
            // a shared process would otherwise keep hosting the old engine
            if let Some(process) = process.filter(|p| p.is_shared()) {
                if let Err(err) = process.kill_engine(&user.cloud_id).await {
                    warn!(user_id = user.id, error = %err, "failed to stop replaced engine");
                }
            }
        }
        let entry = Arc::new(UserEntry::new(&user));
        self.engines.insert(user.id, Arc::clone(&entry));

        let process = match self.find_process_for_user(&user).await {
            Ok(process) => process,
            Err(err) => {
                self.die(&entry, true);
                return Err(err);
            }
        };
        if entry.is_dead() {
            if !process.is_shared() {
                process.kill();
            }
            return Err(EngineError::EngineDead(user.id));
        }
        info!(user_id = user.id, process = process.id(), "running engine for user");
        *lock_unpoisoned(&entry.process) = Some(Arc::clone(&process));
        self.spawn_watcher(&entry, &process);
        if process.state() == ProcessState::Exited {
            self.die(&entry, false);
            return Err(EngineError::EngineDead(user.id));
        }

        let thingpedia = Arc::new(ThingpediaClient::new(user.developer_key.clone(), user.locale.clone()));
        let stub = match process.add_stub(thingpedia) {
            Ok(id) => id,
            Err(err) => {
                self.die(&entry, false);
                return Err(err);
            }
        };
        *lock_unpoisoned(&entry.thingpedia_stub) = Some(stub);

        let started = process
            .run_engine(&user.cloud_id, &user.auth_token, user.developer_key.as_deref(), stub_ref(stub))
            .await;
        let resolved = match started {
            Ok((engine, webhook)) => match resolve_handle(&engine).await {
                Ok(handle) => Ok((handle, webhook)),
                Err(err) => {
                    if let Err(kill_err) = process.kill_engine(&user.cloud_id).await {
                        warn!(user_id = user.id, error = %kill_err, "failed to stop half-started engine");
                    }
                    Err(err)
                }
            },
            Err(err) => Err(err),
        };
        let (handle, webhook) = match resolved {
            Ok(v) => v,
            Err(err) => {
                error!(user_id = user.id, error = %err, "engine failed to start");
                self.die(&entry, true);
                return Err(err);
            }
        };
        if entry.is_dead() {
            return Err(EngineError::EngineDead(user.id));
        }

        *lock_unpoisoned(&entry.engine) = Some(handle.clone());
        self.webhooks.add_client(&user.cloud_id, webhook);
        self.frontend
            .register_endpoint(&websocket_path(&user.cloud_id), upgrade_handler(&process, &user.cloud_id));
        if let (Some(account), Some(chat)) = (&user.external_account_id, self.chat()) {
            chat.add_engine(account, handle);
        }
        Ok(())
    }

    fn spawn_watcher(&self, entry: &Arc<UserEntry>, process: &Arc<EngineProcess>) {
        let mut events = process.subscribe();
        let manager = self.me.clone();
        let entry = Arc::clone(entry);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = entry.cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                let manual = match event {
                    Ok(ProcessEvent::Exit { .. }) => false,
                    Ok(ProcessEvent::EngineRemoved(cloud_id)) if cloud_id == entry.cloud_id => true,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                };
                if let Some(manager) = manager.upgrade() {
                    manager.die(&entry, manual);
                }
                return;
            }
        });
    }

    /// Tears down a user's engine entry. Runs at most once per entry; an
    /// entry that was already replaced only releases its own resources.
    fn die(&self, entry: &Arc<UserEntry>, manual: bool) {
        if entry.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        entry.cancel.cancel();

        let process = lock_unpoisoned(&entry.process).take();
        let stub = lock_unpoisoned(&entry.thingpedia_stub).take();
        if let (Some(process), Some(stub)) = (&process, stub) {
            process.free_stub(stub);
        }
        // a dedicated process lives and dies with its only user
        if let Some(process) = process.as_ref().filter(|p| !p.is_shared()) {
            process.kill();
        }
        lock_unpoisoned(&entry.engine).take();

        let current = self
            .engines
            .remove_if(&entry.user_id, |_, e| Arc::ptr_eq(e, entry))
            .is_some();
        if !current {
            debug!(user_id = entry.user_id, "retired stale engine entry");
            return;
        }
        info!(user_id = entry.user_id, manual, "engine stopped");
        self.unbind(entry);

        let shared = process.as_ref().is_some_and(|p| p.is_shared());
        if !manual && shared && self.is_started() {
            let manager = self.me.clone();
            let user_id = entry.user_id;
            let delay = self.config.user_restart_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(manager) = manager.upgrade().filter(|m| m.is_started()) {
                    manager.restart_user(user_id).await;
                }
            });
        }
    }

    fn unbind(&self, entry: &UserEntry) {
        let account = lock_unpoisoned(&entry.account).clone();
        if let (Some(account), Some(chat)) = (account, self.chat()) {
            chat.remove_engine(&account);
        }
        self.webhooks.remove_client(&entry.cloud_id);
        self.frontend.unregister_endpoint(&websocket_path(&entry.cloud_id));
    }

    fn entry(&self, user_id: i64) -> Option<Arc<UserEntry>> {
        self.engines.get(&user_id).map(|e| Arc::clone(e.value()))
    }

    pub fn is_running(&self, user_id: i64) -> bool {
        self.entry(user_id)
            .is_some_and(|e| lock_unpoisoned(&e.process).is_some())
    }

    /// Id of the process hosting the user's engine: `S<n>` for a shared
    /// process, the user id for a dedicated one.
    pub fn get_process_id(&self, user_id: i64) -> Option<String> {
        let entry = self.entry(user_id)?;
        let process = lock_unpoisoned(&entry.process);
        process.as_ref().map(|p| p.id().to_string())
    }

    pub fn get_engine(&self, user_id: i64) -> Result<EngineHandle, EngineError> {
        let entry = self.entry(user_id).ok_or(EngineError::NotRunning(user_id))?;
        let engine = lock_unpoisoned(&entry.engine).clone();
        engine.ok_or(EngineError::NotRunning(user_id))
    }

    /// Spawns the shared pool and the engines of every known user.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.running.store(true, Ordering::SeqCst);

        let pool: Vec<Arc<EngineProcess>> = (0..self.config.effective_pool_size())
            .map(|i| Arc::new(EngineProcess::shared(i, &self.config)))
            .collect();
        for process in &pool {
            self.processes.insert(process.id().to_string(), Arc::clone(process));
            self.spawn_pool_keeper(process);
        }
        self.pool.set(pool.clone());
        info!(size = pool.len(), "starting shared engine processes");
        let started = join_all(pool.iter().map(|p| p.start())).await;
        for (process, result) in pool.iter().zip(started) {
            if let Err(err) = result {
                error!(process = process.id(), error = %err, "failed to start shared engine process");
            }
        }

        let users = self.store.get_all().await?;
        info!(count = users.len(), "starting user engines");
        let results = join_all(users.into_iter().map(|user| async move {
            let user_id = user.id;
            (user_id, self.run_user(user).await)
        }))
        .await;
        for (user_id, result) in results {
            if let Err(err) = result {
                error!(user_id, error = %err, "failed to start engine");
            }
        }
        Ok(())
    }

    /// Detaches every engine and terminates all processes.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(chat) = self.chat() {
            chat.remove_all_engines();
        }
        self.webhooks.remove_all_clients();

        let entries: Vec<Arc<UserEntry>> = self.engines.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            self.die(&entry, true);
        }

        let processes: Vec<Arc<EngineProcess>> = self.processes.iter().map(|p| Arc::clone(p.value())).collect();
        for process in &processes {
            process.kill();
        }
        let grace = self.config.handshake_timeout;
        join_all(processes.iter().map(|p| p.wait_exited(grace))).await;
        info!("engine manager stopped");
    }

    pub async fn start_user(&self, user_id: i64) -> Result<(), EngineError> {
        let user = self.store.get(user_id).await?;
        info!(user_id, "requested start of engine");
        self.run_user(user).await
    }

    /// Stops the user's engine. Does nothing if it is not running.
    pub async fn kill_user(&self, user_id: i64) -> Result<(), EngineError> {
        let Some(entry) = self.entry(user_id) else { return Ok(()) };
        let process = lock_unpoisoned(&entry.process).clone();
        match process {
            Some(process) => {
                info!(user_id, process = process.id(), "killing engine");
                process.kill_engine(&entry.cloud_id).await
            }
            None => Ok(()),
        }
    }

    /// Stops the user's engine, unlinks it from chat and removes its working
    /// directory.
    pub async fn delete_user(&self, user_id: i64) -> Result<(), EngineError> {
        let entry = self.entry(user_id);
        let cloud_id = match &entry {
            Some(entry) => entry.cloud_id.clone(),
            None => self.store.get(user_id).await?.cloud_id,
        };

        if let Some(entry) = &entry {
            let account = lock_unpoisoned(&entry.account).clone();
            if let (Some(account), Some(chat)) = (account, self.chat()) {
                chat.delete_user(&account);
            }
            let process = lock_unpoisoned(&entry.process).clone();
            if let Some(process) = process {
                if let Err(err) = process.kill_engine(&cloud_id).await {
                    warn!(user_id, error = %err, "failed to stop engine of deleted user");
                }
            }
        }

        let dir = self.config.root.join(&cloud_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Kill then start; failures are logged.
    pub async fn restart_user(&self, user_id: i64) {
        if let Err(err) = self.kill_user(user_id).await {
            warn!(user_id, error = %err, "failed to kill engine before restart");
        }
        if let Err(err) = self.start_user(user_id).await {
            error!(user_id, error = %err, "failed to restart engine");
        }
    }

    /// Links a messaging account to a running user and its engine.
    pub async fn add_account_to_user(&self, user_id: i64, account: &str) -> Result<(), EngineError> {
        let entry = self.entry(user_id).ok_or(EngineError::NotRunning(user_id))?;
        self.store.set_external_account(user_id, Some(account.to_string())).await?;

        let previous = lock_unpoisoned(&entry.account).replace(account.to_string());
        if previous.as_deref() == Some(account) {
            return Ok(());
        }
        let engine = lock_unpoisoned(&entry.engine).clone();
        if let Some(chat) = self.chat() {
            if let Some(previous) = previous {
                chat.remove_engine(&previous);
            }
            if let Some(engine) = engine {
                chat.add_engine(account, engine);
            }
        }
        Ok(())
    }

    /// Asks the process hosting `user_id` to open a direct channel answering
    /// to `reply_id`.
    pub fn send_direct(&self, user_id: i64, reply_id: &str) -> Result<(), EngineError> {
        let entry = self.entry(user_id).ok_or(EngineError::NotRunning(user_id))?;
        let process = lock_unpoisoned(&entry.process).clone();
        let process = process.ok_or(EngineError::EngineDead(user_id))?;
        process.send_control(ControlMessage::Direct { target: user_id, reply_id: reply_id.to_string() })
    }
}

#[async_trait]
impl EngineDirectory for EngineManager {
    fn get_engine(&self, user_id: i64) -> Result<EngineHandle, EngineError> {
        EngineManager::get_engine(self, user_id)
    }

    async fn start_user(&self, user_id: i64) -> Result<(), EngineError> {
        EngineManager::start_user(self, user_id).await
    }
}

async fn resolve_handle(engine: &RemoteHandle) -> Result<EngineHandle, EngineError> {
    let (apps, devices, ui, assistant, messaging) = tokio::try_join!(
        engine.call_handle("getApps", vec![]),
        engine.call_handle("getDevices", vec![]),
        engine.call_handle("getUi", vec![]),
        engine.call_handle("getAssistant", vec![]),
        engine.call_handle("getMessaging", vec![]),
    )?;
    Ok(EngineHandle { apps, devices, ui, assistant, messaging })
}

fn upgrade_handler(process: &Arc<EngineProcess>, cloud_id: &str) -> UpgradeHandler {
    let process = Arc::downgrade(process);
    let cloud_id = cloud_id.to_string();
    Arc::new(move |req: UpgradeRequest| {
        let process = process.upgrade().ok_or_else(|| EngineError::NotReady(cloud_id.clone()))?;
        process.send_control(ControlMessage::Websocket {
            cloud_id: cloud_id.clone(),
            req: req.metadata(),
            upgrade_head: BASE64.encode(&req.head),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchConfig;
    use crate::engine::Isolation;
    use crate::frontend::EndpointTable;
    use crate::model::InMemoryUserStore;
    use engine_rpc::RpcSocket;

    #[derive(Default)]
    struct RecordingChat {
        log: Mutex<Vec<String>>,
    }

    impl ChatDispatcher for RecordingChat {
        fn add_engine(&self, account: &str, _: EngineHandle) {
            lock_unpoisoned(&self.log).push(format!("add {account}"));
        }
        fn remove_engine(&self, account: &str) {
            lock_unpoisoned(&self.log).push(format!("remove {account}"));
        }
        fn remove_all_engines(&self) {
            lock_unpoisoned(&self.log).push("remove all".into());
        }
        fn delete_user(&self, account: &str) {
            lock_unpoisoned(&self.log).push(format!("delete {account}"));
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            root: std::env::temp_dir().join("almond-manager-test"),
            shared_pool_size: 3,
            isolation: Isolation::None,
            launch: LaunchConfig { exec_path: "/nonexistent/engine".into(), exec_args: vec![], engine_path: None },
            ..EngineConfig::default()
        }
    }

    fn manager(store: InMemoryUserStore) -> (Arc<EngineManager>, Arc<EndpointTable>, Arc<RecordingChat>) {
        let frontend = Arc::new(EndpointTable::new());
        let mgr = EngineManager::new(config(), Arc::new(store), Arc::new(WebhookDispatcher::new()), frontend.clone());
        let chat = Arc::new(RecordingChat::default());
        let dyn_chat: Arc<dyn ChatDispatcher> = chat.clone();
        mgr.set_chat_dispatcher(&dyn_chat);
        (mgr, frontend, chat)
    }

    #[test]
    fn shared_pool_is_round_robin() {
        let cfg = config();
        let pool = SharedPool::default();
        assert!(pool.next_process().is_none());
        pool.set((0..3).map(|i| Arc::new(EngineProcess::shared(i, &cfg))).collect());
        let picked: Vec<String> = (0..4).map(|_| pool.next_process().unwrap().id().to_string()).collect();
        assert_eq!(picked, vec!["S0", "S1", "S2", "S0"]);
    }

    #[tokio::test]
    async fn die_runs_once_per_entry() {
        let mut record = TenantRecord::new(1);
        record.external_account_id = Some("acct-1".into());
        let (mgr, frontend, chat) = manager(InMemoryUserStore::with_users(vec![record.clone()]));

        let entry = Arc::new(UserEntry::new(&record));
        let (socket, _frames) = RpcSocket::new();
        mgr.engines.insert(1, Arc::clone(&entry));
        mgr.webhooks.add_client(&record.cloud_id, socket.remote(9));
        let path = websocket_path(&record.cloud_id);
        frontend.register_endpoint(&path, Arc::new(|_: UpgradeRequest| Ok::<(), EngineError>(())));

        mgr.die(&entry, false);
        mgr.die(&entry, false);

        assert_eq!(*lock_unpoisoned(&chat.log), vec!["remove acct-1"]);
        assert!(!mgr.webhooks.has_client(&record.cloud_id));
        assert!(!frontend.contains(&path));
        assert!(!mgr.is_running(1));
        assert!(matches!(mgr.get_engine(1), Err(EngineError::NotRunning(1))));
    }

    #[tokio::test]
    async fn stale_entries_leave_the_current_one_alone() {
        let mut record = TenantRecord::new(2);
        record.external_account_id = Some("acct-2".into());
        let (mgr, _frontend, chat) = manager(InMemoryUserStore::new());

        let stale = Arc::new(UserEntry::new(&record));
        let current = Arc::new(UserEntry::new(&record));
        mgr.engines.insert(2, Arc::clone(&current));
        mgr.die(&stale, false);

        assert!(lock_unpoisoned(&chat.log).is_empty());
        assert!(Arc::ptr_eq(&mgr.entry(2).unwrap(), &current));
    }

    #[tokio::test]
    async fn unknown_users_are_not_running() {
        let (mgr, _, _) = manager(InMemoryUserStore::new());
        assert!(!mgr.is_running(5));
        assert_eq!(mgr.get_process_id(5), None);
        assert!(matches!(mgr.send_direct(5, "r"), Err(EngineError::NotRunning(5))));
        assert!(mgr.kill_user(5).await.is_ok());
        assert!(matches!(mgr.add_account_to_user(5, "a").await, Err(EngineError::NotRunning(5))));
    }

    #[tokio::test]
    async fn dedicated_spawn_failures_are_reported() {
        let mut record = TenantRecord::new(3);
        record.developer_key = Some("dev".into());
        let (mgr, _, _) = manager(InMemoryUserStore::with_users(vec![record]));
        let err = mgr.start_user(3).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }), "{err}");
        assert!(!mgr.is_running(3));
    }
}
