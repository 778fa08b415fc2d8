//! One engine child process and the control channel to it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use engine_rpc::control::{read_control, spawn_control_writer};
use engine_rpc::{ControlMessage, JsonDatagramReader, JsonDatagramWriter, RemoteHandle, RpcSocket, RpcStub};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{EngineError, Isolation};
use crate::config::{EngineConfig, LaunchConfig};
use crate::util::{filter_env, lock_unpoisoned};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unstarted,
    Starting,
    Ready,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The child exited. Emitted once per child.
    Exit { code: Option<i32> },
    /// A shared process stopped the engine of `cloud_id` on request.
    EngineRemoved(String),
}

// channel to the currently running child
struct Connection {
    generation: u64,
    pid: Option<u32>,
    socket: RpcSocket,
    root: Option<u64>,
    control: mpsc::UnboundedSender<ControlMessage>,
}

pub struct EngineProcess {
    id: String,
    cloud_id: Option<String>,
    shared: bool,
    cwd: PathBuf,
    isolation: Isolation,
    launch: LaunchConfig,
    handshake_timeout: Duration,
    use_count: AtomicUsize,
    generation: AtomicU64,
    state: watch::Sender<ProcessState>,
    events: broadcast::Sender<ProcessEvent>,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineProcess")
            .field("id", &self.id)
            .field("shared", &self.shared)
            .field("state", &self.state())
            .field("use_count", &self.use_count())
            .finish()
    }
}

impl EngineProcess {
    /// A pool process hosting many engines, identified as `S<index>`.
    pub fn shared(index: usize, config: &EngineConfig) -> Self {
        Self::build(format!("S{index}"), None, true, config.root.clone(), config)
    }

    /// A process running the engine of a single user, in `<root>/<cloud id>`.
    pub fn dedicated(user_id: i64, cloud_id: &str, config: &EngineConfig) -> Self {
        Self::build(
            user_id.to_string(),
            Some(cloud_id.to_string()),
            false,
            config.root.join(cloud_id),
            config,
        )
    }

    fn build(id: String, cloud_id: Option<String>, shared: bool, cwd: PathBuf, config: &EngineConfig) -> Self {
        let (state, _) = watch::channel(ProcessState::Unstarted);
        let (events, _) = broadcast::channel(64);
        Self {
            id,
            cloud_id,
            shared,
            cwd,
            isolation: config.isolation.clone(),
            launch: config.launch.clone(),
            handshake_timeout: config.handshake_timeout,
            use_count: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            state,
            events,
            conn: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn use_count(&self) -> usize {
        self.use_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        lock_unpoisoned(&self.conn).as_ref().and_then(|c| c.pid)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    /// The RPC socket of the running child.
    pub fn socket(&self) -> Option<RpcSocket> {
        lock_unpoisoned(&self.conn).as_ref().map(|c| c.socket.clone())
    }

    /// The command line for the child, without the environment.
    pub fn command_line(&self) -> (PathBuf, Vec<String>) {
        let mut args: Vec<String> = self.launch.exec_args.clone();
        if let Some(engine) = &self.launch.engine_path {
            args.push(engine.to_string_lossy().into_owned());
        }
        if self.shared {
            args.push("--shared".into());
            return (self.launch.exec_path.clone(), args);
        }
        match (&self.isolation, &self.cloud_id) {
            (Isolation::Sandboxed { wrapper }, Some(cloud_id)) => {
                let mut wrapped = vec!["-i".to_string(), cloud_id.clone()];
                wrapped.push(self.launch.exec_path.to_string_lossy().into_owned());
                wrapped.extend(args);
                (wrapper.clone(), wrapped)
            }
            _ => (self.launch.exec_path.clone(), args),
        }
    }

    fn stderr_mode(&self) -> Stdio {
        if self.shared {
            Stdio::inherit()
        } else if matches!(self.isolation, Isolation::Sandboxed { .. }) {
            Stdio::null()
        } else {
            Stdio::piped()
        }
    }

    /// Spawns the child and waits for its `rpc-ready` handshake.
    ///
    /// Fails if the child exits first or the handshake does not arrive within
    /// the configured timeout, in which case the child is killed.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        self.state.send_replace(ProcessState::Starting);
        tokio::fs::create_dir_all(&self.cwd).await?;

        let (program, args) = self.command_line();
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&self.cwd)
            .env_clear()
            .envs(filter_env(std::env::vars_os()))
            .env("THINGENGINE_USER_ID", &self.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(self.stderr_mode())
            .process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.state.send_replace(ProcessState::Exited);
                return Err(EngineError::Spawn { id: self.id.clone(), source });
            }
        };
        let pid = child.id();
        info!(process = %self.id, ?pid, program = %program.display(), "spawned engine process");

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            self.state.send_replace(ProcessState::Exited);
            return Err(EngineError::NotReady(self.id.clone()));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(self.id.clone(), pid, stderr));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (socket, rpc_frames) = RpcSocket::new();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        spawn_control_writer(JsonDatagramWriter::new(stdin), rpc_frames, control_rx);
        *lock_unpoisoned(&self.conn) = Some(Connection {
            generation,
            pid,
            socket: socket.clone(),
            root: None,
            control: control_tx,
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let id = self.id.clone();
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            read_control(JsonDatagramReader::new(stdout), socket, |msg| match msg {
                ControlMessage::RpcReady { id: root } => match ready_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(root);
                    }
                    None => warn!(process = %id, "duplicate rpc-ready ignored"),
                },
                other => debug!(process = %id, kind = other.kind(), "unexpected control message"),
            })
            .await;
        });

        let (exit_tx, exit_rx) = oneshot::channel();
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    error!(process = %me.id, error = %err, "failed to wait for engine process");
                    None
                }
            };
            me.on_exit(generation, code);
            let _ = exit_tx.send(code);
        });

        tokio::select! {
            ready = ready_rx => match ready {
                Ok(root) => {
                    if let Some(conn) = lock_unpoisoned(&self.conn).as_mut().filter(|c| c.generation == generation) {
                        conn.root = Some(root);
                    }
                    self.state.send_replace(ProcessState::Ready);
                    info!(process = %self.id, root, "engine process ready");
                    Ok(())
                }
                // the reader hit end of stream before the handshake
                Err(_) => Err(EngineError::Exited { id: self.id.clone(), code: None }),
            },
            code = exit_rx => Err(EngineError::Exited { id: self.id.clone(), code: code.ok().flatten() }),
            _ = tokio::time::sleep(self.handshake_timeout) => {
                warn!(process = %self.id, "engine process did not complete the handshake");
                self.kill();
                Err(EngineError::HandshakeTimeout { id: self.id.clone(), timeout: self.handshake_timeout })
            }
        }
    }

    fn on_exit(&self, generation: u64, code: Option<i32>) {
        let conn = {
            let mut guard = lock_unpoisoned(&self.conn);
            if guard.as_ref().is_some_and(|c| c.generation == generation) { guard.take() } else { None }
        };
        if let Some(conn) = conn {
            conn.socket.close();
        }
        if self.generation.load(Ordering::SeqCst) == generation {
            self.state.send_replace(ProcessState::Exited);
        }
        if code == Some(0) {
            info!(process = %self.id, "engine process exited");
        } else {
            warn!(process = %self.id, ?code, "engine process exited abnormally");
        }
        let _ = self.events.send(ProcessEvent::Exit { code });
    }

    /// Starts the child again after `delay`.
    pub async fn restart(self: &Arc<Self>, delay: Duration) -> Result<(), EngineError> {
        self.state.send_replace(ProcessState::Starting);
        tokio::time::sleep(delay).await;
        self.start().await
    }

    /// Waits until the child has completed its handshake.
    pub async fn wait_ready(&self) -> Result<(), EngineError> {
        let mut state = self.state.subscribe();
        match tokio::time::timeout(self.handshake_timeout, state.wait_for(|s| *s == ProcessState::Ready)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(EngineError::NotReady(self.id.clone())),
        }
    }

    /// Waits for the child to go away; returns false on timeout.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        let gone = state.wait_for(|s| matches!(s, ProcessState::Exited | ProcessState::Unstarted));
        matches!(tokio::time::timeout(timeout, gone).await, Ok(Ok(_)))
    }

    fn root(&self) -> Result<(RpcSocket, u64), EngineError> {
        let conn = lock_unpoisoned(&self.conn);
        match conn.as_ref() {
            Some(Connection { socket, root: Some(root), .. }) => Ok((socket.clone(), *root)),
            _ => Err(EngineError::NotReady(self.id.clone())),
        }
    }

    /// Exposes a local object to the child and returns its id.
    pub fn add_stub(&self, stub: Arc<dyn RpcStub>) -> Result<u64, EngineError> {
        let (socket, _) = self.root()?;
        Ok(socket.add_stub(stub))
    }

    pub fn free_stub(&self, id: u64) {
        if let Some(socket) = self.socket() {
            socket.free_stub(id);
        }
    }

    /// Asks the child to run an engine; returns the engine and its webhook
    /// handler.
    pub async fn run_engine(
        &self,
        cloud_id: &str,
        auth_token: &str,
        developer_key: Option<&str>,
        thingpedia: Value,
    ) -> Result<(RemoteHandle, RemoteHandle), EngineError> {
        let (socket, root) = self.root()?;
        self.use_count.fetch_add(1, Ordering::SeqCst);
        let reply = socket
            .call(root, "runEngine", vec![json!(cloud_id), json!(auth_token), json!(developer_key), thingpedia])
            .await;
        let result = reply.map_err(EngineError::from).and_then(|reply| {
            let engine = RemoteHandle::from_value(&socket, &reply[0])?;
            let webhook = RemoteHandle::from_value(&socket, &reply[1])?;
            Ok((engine, webhook))
        });
        if result.is_err() {
            self.release_use();
        }
        result
    }

    fn release_use(&self) {
        let _ = self
            .use_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    /// Stops the engine of `cloud_id`. A dedicated process is killed; a
    /// shared one is asked over RPC and announces
    /// [`ProcessEvent::EngineRemoved`] when done.
    pub async fn kill_engine(&self, cloud_id: &str) -> Result<(), EngineError> {
        if !self.shared {
            self.kill();
            return Ok(());
        }
        let (socket, root) = self.root()?;
        socket.call(root, "killEngine", vec![json!(cloud_id)]).await?;
        self.release_use();
        let _ = self.events.send(ProcessEvent::EngineRemoved(cloud_id.to_string()));
        Ok(())
    }

    /// Sends SIGTERM to the child, if one is running.
    pub fn kill(&self) {
        let Some(pid) = self.pid() else { return };
        info!(process = %self.id, pid, "killing engine process");
        let Ok(raw) = i32::try_from(pid) else { return };
        if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            warn!(process = %self.id, pid, error = %err, "failed to signal engine process");
        }
    }

    pub fn send_control(&self, msg: ControlMessage) -> Result<(), EngineError> {
        let conn = lock_unpoisoned(&self.conn);
        match conn.as_ref() {
            Some(c) if c.control.send(msg).is_ok() => Ok(()),
            _ => Err(EngineError::NotReady(self.id.clone())),
        }
    }
}

async fn forward_stderr(id: String, pid: Option<u32>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(user_id = %id, ?pid, "{line}");
    }
}
