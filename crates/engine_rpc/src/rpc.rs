//! Remote call layer.
//!
//! Each side of a connection keeps a table of local stubs, addressed by a
//! numeric id, and a table of outstanding calls. A call frame looks like
//! `{"id": 7, "to": 2, "method": "runEngine", "args": [...]}` and is answered
//! by `{"id": 7, "reply": ...}` or `{"id": 7, "error": "..."}`.
//!
//! Objects travel by reference as `{"$rpcId": n}`; the id always names an
//! entry in the stub table of whoever sent the value.
//!
//! The socket itself is transport agnostic: outgoing frames are pushed into an
//! unbounded channel handed out by [`RpcSocket::new`], and incoming frames are
//! fed to [`RpcSocket::handle_frame`].

use std::fmt;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub const RPC_ID_KEY: &str = "$rpcId";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection closed")]
    Closed,
    #[error("Invalid object ID {0}")]
    InvalidObject(u64),
    #[error("Invalid method {method} on object {object}")]
    InvalidMethod { object: u64, method: String },
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Remote(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("unexpected reply: {0}")]
    BadReply(String),
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

/// A locally registered object whose methods can be called by the peer.
///
/// `methods` is the complete remotely callable surface; calls naming anything
/// else are rejected before `invoke` runs.
#[async_trait]
pub trait RpcStub: Send + Sync + 'static {
    fn methods(&self) -> &'static [&'static str];

    async fn invoke(
        &self,
        socket: &RpcSocket,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CallFrame {
    id: u64,
    to: u64,
    method: String,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplyFrame {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// outgoing frames only; incoming ones are classified by their fields
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum Frame {
    Call(CallFrame),
    Reply(ReplyFrame),
}

type PendingReply = oneshot::Sender<Result<Value, RpcError>>;

struct Inner {
    stubs: DashMap<u64, Arc<dyn RpcStub>>,
    pending: DashMap<u64, PendingReply>,
    next_call: AtomicU64,
    next_stub: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    closed: AtomicBool,
}

impl Inner {
    fn send(&self, frame: Value) -> bool {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        outbound.as_ref().is_some_and(|tx| tx.send(frame).is_ok())
    }
}

/// One end of an RPC connection. Cloning shares the same tables.
#[derive(Clone)]
pub struct RpcSocket {
    inner: Arc<Inner>,
}

impl fmt::Debug for RpcSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSocket")
            .field("stubs", &self.inner.stubs.len())
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcSocket {
    /// Creates a socket together with the stream of frames it wants written
    /// to the transport.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            stubs: DashMap::new(),
            pending: DashMap::new(),
            next_call: AtomicU64::new(1),
            next_stub: AtomicU64::new(1),
            outbound: Mutex::new(Some(outbound)),
            closed: AtomicBool::new(false),
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    pub fn add_stub(&self, stub: Arc<dyn RpcStub>) -> u64 {
        let id = self.inner.next_stub.fetch_add(1, Ordering::SeqCst);
        self.inner.stubs.insert(id, stub);
        id
    }

    pub fn free_stub(&self, id: u64) -> bool {
        self.inner.stubs.remove(&id).is_some()
    }

    pub fn has_stub(&self, id: u64) -> bool {
        self.inner.stubs.contains_key(&id)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Handle for an object living in the peer's stub table.
    pub fn remote(&self, id: u64) -> RemoteHandle {
        RemoteHandle { socket: self.clone(), id }
    }

    /// Calls `method` on the peer's stub `to`.
    pub async fn call(&self, to: u64, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let id = self.inner.next_call.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        // close() may have drained the table between the check and the insert
        if self.is_closed() {
            self.inner.pending.remove(&id);
            return Err(RpcError::Closed);
        }

        let frame = serde_json::to_value(Frame::Call(CallFrame {
            id,
            to,
            method: method.to_string(),
            args,
        }))?;
        if !self.inner.send(frame) {
            self.inner.pending.remove(&id);
            return Err(RpcError::Closed);
        }

        rx.await.map_err(|_| RpcError::Closed)?
    }

    /// Routes one incoming frame. Replies complete pending calls; calls are
    /// dispatched to the addressed stub on a separate task.
    ///
    /// A frame naming a `method` or a target object is a call, even when it
    /// fails to decode; only frames carrying `reply` or `error` may complete
    /// a pending call.
    pub fn handle_frame(&self, frame: Value) {
        let (is_call, is_reply, id) = match frame.as_object() {
            Some(fields) => (
                fields.contains_key("method") || fields.contains_key("to"),
                fields.contains_key("reply") || fields.contains_key("error"),
                fields.get("id").and_then(Value::as_u64),
            ),
            None => (false, false, None),
        };

        if is_call {
            match serde_json::from_value::<CallFrame>(frame) {
                Ok(call) => {
                    let socket = self.clone();
                    tokio::spawn(async move { socket.dispatch(call).await });
                }
                Err(err) => match id {
                    Some(id) => {
                        debug!(id, error = %err, "rejecting malformed rpc call");
                        self.send_reply(ReplyFrame { id, reply: None, error: Some(format!("malformed call: {err}")) });
                    }
                    None => warn!(error = %err, "ignoring rpc call without an id"),
                },
            }
        } else if is_reply {
            match serde_json::from_value::<ReplyFrame>(frame) {
                Ok(reply) => self.complete(reply),
                Err(err) => warn!(error = %err, "ignoring malformed rpc reply"),
            }
        } else {
            warn!("ignoring rpc frame that is neither a call nor a reply");
        }
    }

    fn complete(&self, reply: ReplyFrame) {
        let Some((_, tx)) = self.inner.pending.remove(&reply.id) else {
            debug!(id = reply.id, "reply for unknown or abandoned call");
            return;
        };
        let result = match reply.error {
            Some(msg) => Err(RpcError::Remote(msg)),
            None => Ok(reply.reply.unwrap_or(Value::Null)),
        };
        let _ = tx.send(result);
    }

    async fn dispatch(&self, call: CallFrame) {
        let result = match self.inner.stubs.get(&call.to).map(|s| Arc::clone(s.value())) {
            None => Err(RpcError::InvalidObject(call.to)),
            Some(stub) if !stub.methods().contains(&call.method.as_str()) => {
                Err(RpcError::InvalidMethod { object: call.to, method: call.method.clone() })
            }
            Some(stub) => stub.invoke(self, &call.method, call.args).await,
        };

        let reply = match result {
            Ok(value) => ReplyFrame { id: call.id, reply: Some(value), error: None },
            Err(err) => {
                debug!(id = call.id, method = %call.method, error = %err, "rpc call failed");
                ReplyFrame { id: call.id, reply: None, error: Some(err.to_string()) }
            }
        };
        self.send_reply(reply);
    }

    fn send_reply(&self, reply: ReplyFrame) {
        match serde_json::to_value(Frame::Reply(reply)) {
            Ok(frame) => {
                self.inner.send(frame);
            }
            Err(err) => warn!(error = %err, "failed to encode rpc reply"),
        }
    }

    /// Marks the socket closed, fails every outstanding call and drops the
    /// local stubs. The outbound frame stream ends once in-flight replies
    /// have been dropped.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.inner.stubs.clear();
        let ids: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.inner.pending.remove(&id) {
                let _ = tx.send(Err(RpcError::Closed));
            }
        }
    }
}

/// Encodes a local stub id for transmission.
pub fn stub_ref(id: u64) -> Value {
    json!({ RPC_ID_KEY: id })
}

/// Extracts the stub id from a `{"$rpcId": n}` value.
pub fn parse_stub_ref(value: &Value) -> Option<u64> {
    value.as_object()?.get(RPC_ID_KEY)?.as_u64()
}

/// Deserializes positional argument `idx`.
pub fn arg<T: DeserializeOwned>(args: &[Value], idx: usize) -> Result<T, RpcError> {
    let value = args.get(idx).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|err| RpcError::InvalidArguments(format!("argument {idx}: {err}")))
}

/// An object owned by the peer.
#[derive(Clone, Debug)]
pub struct RemoteHandle {
    socket: RpcSocket,
    id: u64,
}

impl RemoteHandle {
    /// Builds a handle from a `{"$rpcId": n}` value received from the peer.
    pub fn from_value(socket: &RpcSocket, value: &Value) -> Result<Self, RpcError> {
        parse_stub_ref(value)
            .map(|id| socket.remote(id))
            .ok_or_else(|| RpcError::BadReply(format!("expected an object reference, got {value}")))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn socket(&self) -> &RpcSocket {
        &self.socket
    }

    pub async fn call(&self, method: impl AsRef<str>, args: Vec<Value>) -> Result<Value, RpcError> {
        self.socket.call(self.id, method.as_ref(), args).await
    }

    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: impl AsRef<str>,
        args: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(|err| RpcError::BadReply(err.to_string()))
    }

    /// Calls a method that returns another remote object.
    pub async fn call_handle(
        &self,
        method: impl AsRef<str>,
        args: Vec<Value>,
    ) -> Result<RemoteHandle, RpcError> {
        let value = self.call(method, args).await?;
        RemoteHandle::from_value(&self.socket, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use strum::VariantNames;
    use strum_macros::{AsRefStr, EnumString, VariantNames};

    #[derive(Debug, EnumString, AsRefStr, VariantNames)]
    #[strum(serialize_all = "camelCase")]
    enum CalcMethod {
        Add,
        Fail,
        Slow,
        MakeCounter,
    }

    struct Calc;

    #[async_trait]
    impl RpcStub for Calc {
        fn methods(&self) -> &'static [&'static str] {
            CalcMethod::VARIANTS
        }

        async fn invoke(&self, socket: &RpcSocket, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
            match method.parse::<CalcMethod>() {
                Ok(CalcMethod::Add) => {
                    let a: i64 = arg(&args, 0)?;
                    let b: i64 = arg(&args, 1)?;
                    Ok(json!(a + b))
                }
                Ok(CalcMethod::Fail) => Err(RpcError::Remote("boom".into())),
                Ok(CalcMethod::Slow) => {
                    let ms: u64 = arg(&args, 0)?;
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!(ms))
                }
                Ok(CalcMethod::MakeCounter) => {
                    let id = socket.add_stub(Arc::new(Counter(AtomicUsize::new(0))));
                    Ok(stub_ref(id))
                }
                Err(_) => Err(RpcError::InvalidMethod { object: 0, method: method.into() }),
            }
        }
    }

    struct Counter(AtomicUsize);

    #[async_trait]
    impl RpcStub for Counter {
        fn methods(&self) -> &'static [&'static str] {
            &["next"]
        }

        async fn invoke(&self, _: &RpcSocket, _: &str, _: Vec<Value>) -> Result<Value, RpcError> {
            Ok(json!(self.0.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }

    /// Two sockets wired back to back through their outbound channels.
    fn pair() -> (RpcSocket, RpcSocket) {
        let (a, mut a_out) = RpcSocket::new();
        let (b, mut b_out) = RpcSocket::new();
        let (a2, b2) = (a.clone(), b.clone());
        tokio::spawn(async move {
            while let Some(frame) = a_out.recv().await {
                b2.handle_frame(frame);
            }
        });
        tokio::spawn(async move {
            while let Some(frame) = b_out.recv().await {
                a2.handle_frame(frame);
            }
        });
        (a, b)
    }

    #[tokio::test]
    async fn call_resolves_with_remote_result() {
        let (client, server) = pair();
        let id = server.add_stub(Arc::new(Calc));
        let sum = client.call(id, "add", vec![json!(2), json!(40)]).await.unwrap();
        assert_eq!(sum, json!(42));
    }

    #[tokio::test]
    async fn remote_errors_propagate_by_message() {
        let (client, server) = pair();
        let id = server.add_stub(Arc::new(Calc));
        let err = client.call(id, "fail", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref m) if m == "boom"));
    }

    #[tokio::test]
    async fn unknown_object_and_method_are_rejected_without_breaking_the_socket() {
        let (client, server) = pair();
        let id = server.add_stub(Arc::new(Calc));

        let err = client.call(id + 100, "add", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref m) if m.contains("Invalid object ID")));

        let err = client.call(id, "toString", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref m) if m.contains("Invalid method")));

        let ok = client.call(id, "add", vec![json!(1), json!(1)]).await.unwrap();
        assert_eq!(ok, json!(2));
    }

    #[tokio::test]
    async fn object_references_become_remote_handles() {
        let (client, server) = pair();
        let calc = client.remote(server.add_stub(Arc::new(Calc)));
        let counter = calc.call_handle("makeCounter", vec![]).await.unwrap();
        assert_eq!(counter.call_as::<u64>("next", vec![]).await.unwrap(), 1);
        assert_eq!(counter.call_as::<u64>("next", vec![]).await.unwrap(), 2);

        assert!(server.free_stub(counter.id()));
        assert!(counter.call("next", vec![]).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_get_distinct_ids_and_resolve_independently() {
        let (client, server) = pair();
        let id = server.add_stub(Arc::new(Calc));

        let calls = (0..5u64).map(|i| {
            let client = client.clone();
            async move { client.call(id, "slow", vec![json!((5 - i) * 10)]).await }
        });
        let results = futures::future::join_all(calls).await;
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap().as_u64().unwrap()).collect();
        assert_eq!(values, vec![50, 40, 30, 20, 10]);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn closing_rejects_every_pending_call() {
        // nobody ever answers: the outbound receiver is held but never drained
        let (socket, _outbound) = RpcSocket::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let socket = socket.clone();
            handles.push(tokio::spawn(async move { socket.call(1, "anything", vec![]).await }));
        }
        while socket.pending_calls() < 4 {
            tokio::task::yield_now().await;
        }
        socket.close();
        for h in handles {
            assert!(matches!(h.await.unwrap(), Err(RpcError::Closed)));
        }
        assert!(matches!(socket.call(1, "anything", vec![]).await, Err(RpcError::Closed)));
    }

    #[tokio::test]
    async fn malformed_calls_are_answered_and_leave_pending_calls_alone() {
        let (socket, mut outbound) = RpcSocket::new();
        let caller = socket.clone();
        let pending = tokio::spawn(async move { caller.call(3, "add", vec![]).await });
        let sent = outbound.recv().await.unwrap();
        assert_eq!(sent["id"], json!(1));

        // the peer numbers its calls from 1 too
        socket.handle_frame(json!({"id": 1, "to": 3, "method": "x", "args": {"not": "array"}}));
        let answer = outbound.recv().await.unwrap();
        assert_eq!(answer["id"], json!(1));
        assert!(answer["error"].as_str().unwrap().contains("malformed call"));
        socket.handle_frame(json!({"id": 1, "method": "x"}));
        let answer = outbound.recv().await.unwrap();
        assert!(answer["error"].is_string());
        assert_eq!(socket.pending_calls(), 1);

        socket.handle_frame(json!({"id": 1}));
        assert_eq!(socket.pending_calls(), 1);

        socket.handle_frame(json!({"id": 1, "reply": 5}));
        assert_eq!(pending.await.unwrap().unwrap(), json!(5));
    }

    #[test]
    fn stub_refs_round_trip() {
        assert_eq!(parse_stub_ref(&stub_ref(9)), Some(9));
        assert_eq!(parse_stub_ref(&json!({"other": 9})), None);
        assert_eq!(parse_stub_ref(&json!(9)), None);
    }
}
