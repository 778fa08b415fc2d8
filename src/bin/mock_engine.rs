//! A stand-in engine process speaking the control protocol over stdio.
//!
//! Used by the integration tests and for running the cloud without a real
//! engine. Every engine echoes what it is told back through the
//! conversation delegate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use dashmap::DashMap;
use engine_rpc::rpc::{arg, parse_stub_ref, stub_ref};
use engine_rpc::worker::{WorkerContext, serve_stdio};
use engine_rpc::{ControlMessage, RpcError, RpcSocket, RpcStub};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mock-engine")]
struct Args {
    /// Engine script path handed over by the supervisor; ignored
    script: Option<String>,

    /// Host several engines in this process
    #[arg(long)]
    shared: bool,

    /// Exit with this code before the handshake
    #[arg(long)]
    exit_immediately: Option<i32>,

    /// Never send the handshake
    #[arg(long)]
    no_handshake: bool,

    /// Exit with code 1 this many milliseconds after the handshake
    #[arg(long)]
    crash_after_ms: Option<u64>,

    /// Write a few unrelated frames before the handshake
    #[arg(long)]
    noise_before_handshake: bool,
}

async fn write_noise() -> std::io::Result<()> {
    let frames = [
        json!({ "type": "direct", "target": 0, "replyId": "early" }),
        json!({ "type": "progress", "percent": 10 }),
        json!({ "no": "type" }),
    ];
    let mut stdout = tokio::io::stdout();
    for frame in frames {
        stdout.write_all(format!("{frame}\n").as_bytes()).await?;
    }
    stdout.flush().await
}

fn stub_arg(args: &[Value], idx: usize) -> Result<u64, RpcError> {
    let value = args.get(idx).cloned().unwrap_or(Value::Null);
    parse_stub_ref(&value).ok_or_else(|| RpcError::InvalidArguments(format!("argument {idx}: expected an object")))
}

struct Inert;

#[async_trait]
impl RpcStub for Inert {
    fn methods(&self) -> &'static [&'static str] {
        &["ping"]
    }

    async fn invoke(&self, _: &RpcSocket, _: &str, _: Vec<Value>) -> Result<Value, RpcError> {
        Ok(json!("pong"))
    }
}

struct Conversation {
    feed_id: String,
    delegate: u64,
}

#[async_trait]
impl RpcStub for Conversation {
    fn methods(&self) -> &'static [&'static str] {
        &["start", "handleCommand", "handleParsedCommand"]
    }

    async fn invoke(&self, socket: &RpcSocket, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let reply = match method {
            "start" => return Ok(Value::Null),
            "handleCommand" => format!("echo: {}", arg::<String>(&args, 0)?),
            _ => format!("parsed: {}", arg::<String>(&args, 0)?),
        };
        info!(feed_id = %self.feed_id, %reply, "answering");
        socket.call(self.delegate, "send", vec![json!(reply)]).await?;
        Ok(Value::Null)
    }
}

struct Assistant;

#[async_trait]
impl RpcStub for Assistant {
    fn methods(&self) -> &'static [&'static str] {
        &["openConversation"]
    }

    async fn invoke(&self, socket: &RpcSocket, _: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let feed_id: String = arg(&args, 0)?;
        let delegate = stub_arg(&args, 2)?;
        let id = socket.add_stub(Arc::new(Conversation { feed_id, delegate }));
        Ok(stub_ref(id))
    }
}

struct Engine {
    objects: [u64; 5],
}

#[async_trait]
impl RpcStub for Engine {
    fn methods(&self) -> &'static [&'static str] {
        &["getApps", "getDevices", "getUi", "getAssistant", "getMessaging"]
    }

    async fn invoke(&self, _: &RpcSocket, method: &str, _: Vec<Value>) -> Result<Value, RpcError> {
        let idx = self.methods().iter().position(|m| *m == method).unwrap_or(0);
        Ok(stub_ref(self.objects[idx]))
    }
}

struct Webhook {
    cloud_id: String,
}

#[async_trait]
impl RpcStub for Webhook {
    fn methods(&self) -> &'static [&'static str] {
        &["handleCallback"]
    }

    async fn invoke(&self, _: &RpcSocket, _: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let id: String = arg(&args, 0)?;
        let method: String = arg(&args, 1)?;
        Ok(json!({ "cloudId": self.cloud_id, "id": id, "method": method }))
    }
}

struct Root {
    shared: bool,
    // cloud id to the stubs owned by that engine
    engines: DashMap<String, Vec<u64>>,
}

impl Root {
    fn free(&self, socket: &RpcSocket, cloud_id: &str) -> bool {
        match self.engines.remove(cloud_id) {
            Some((_, stubs)) => {
                for id in stubs {
                    socket.free_stub(id);
                }
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl RpcStub for Root {
    fn methods(&self) -> &'static [&'static str] {
        &["runEngine", "killEngine"]
    }

    async fn invoke(&self, socket: &RpcSocket, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let cloud_id: String = arg(&args, 0)?;
        if method == "killEngine" {
            info!(%cloud_id, "killing engine");
            if !self.free(socket, &cloud_id) {
                return Err(RpcError::Remote(format!("no engine for {cloud_id}")));
            }
            return Ok(Value::Null);
        }

        if !self.shared && !self.engines.is_empty() {
            return Err(RpcError::Remote("dedicated process already runs an engine".into()));
        }
        let thingpedia = stub_arg(&args, 3)?;
        let locale = socket.call(thingpedia, "getLocale", vec![]).await?;
        info!(%cloud_id, %locale, "running engine");

        let apps = socket.add_stub(Arc::new(Inert));
        let devices = socket.add_stub(Arc::new(Inert));
        let ui = socket.add_stub(Arc::new(Inert));
        let assistant = socket.add_stub(Arc::new(Assistant));
        let messaging = socket.add_stub(Arc::new(Inert));
        let engine = socket.add_stub(Arc::new(Engine { objects: [apps, devices, ui, assistant, messaging] }));
        let webhook = socket.add_stub(Arc::new(Webhook { cloud_id: cloud_id.clone() }));

        self.free(socket, &cloud_id);
        self.engines
            .insert(cloud_id, vec![apps, devices, ui, assistant, messaging, engine, webhook]);
        Ok(json!([stub_ref(engine), stub_ref(webhook)]))
    }
}

fn on_control(_: &WorkerContext, msg: ControlMessage) {
    match msg {
        ControlMessage::Websocket { cloud_id, req, .. } => info!(%cloud_id, url = %req.url, "websocket handed over"),
        ControlMessage::Direct { target, reply_id } => info!(target, %reply_id, "direct connection requested"),
        other => warn!(kind = other.kind(), "unexpected control message"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).with_ansi(false).init();
    let args = Args::parse();

    if let Some(code) = args.exit_immediately {
        std::process::exit(code);
    }
    if args.no_handshake {
        // keep the pipe open without ever answering
        let _ = tokio::io::copy(&mut tokio::io::stdin(), &mut tokio::io::sink()).await;
        return;
    }
    if args.noise_before_handshake {
        if let Err(err) = write_noise().await {
            warn!(error = %err, "failed to write early frames");
        }
    }
    if let Some(ms) = args.crash_after_ms {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            warn!("crashing on request");
            std::process::exit(1);
        });
    }

    let shared = args.shared;
    serve_stdio(
        move |_ctx| Arc::new(Root { shared, engines: DashMap::new() }) as Arc<dyn RpcStub>,
        on_control,
    )
    .await;
    info!("supervisor went away");
}
