//! Control envelope exchanged between the supervisor and an engine process.
//!
//! The child's stdin carries supervisor → child traffic and its stdout the
//! reverse. Every line is one envelope, discriminated by `type`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::datagram::{JsonDatagramReader, JsonDatagramWriter};
use crate::rpc::RpcSocket;

/// Request metadata forwarded with a websocket hand-off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketRequest {
    pub http_version: String,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// A frame of the remote call layer.
    Rpc { data: Value },
    /// Startup handshake carrying the id of the child's root stub.
    RpcReady { id: u64 },
    /// HTTP upgrade forwarded to the engine owning `cloud_id`.
    #[serde(rename_all = "camelCase")]
    Websocket {
        cloud_id: String,
        req: WebSocketRequest,
        /// base64 encoded upgrade head
        upgrade_head: String,
    },
    #[serde(rename_all = "camelCase")]
    Direct { target: i64, reply_id: String },
}

impl ControlMessage {
    /// Decodes an envelope. Unknown or malformed envelopes yield `None`.
    pub fn parse(value: Value) -> Option<Self> {
        match serde_json::from_value::<ControlMessage>(value) {
            Ok(msg) => Some(msg),
            Err(err) => {
                debug!(error = %err, "ignoring unrecognised control message");
                None
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Rpc { .. } => "rpc",
            ControlMessage::RpcReady { .. } => "rpc-ready",
            ControlMessage::Websocket { .. } => "websocket",
            ControlMessage::Direct { .. } => "direct",
        }
    }
}

/// Spawns the task that owns the write half of a control channel.
///
/// Frames produced by the RPC socket are wrapped into `rpc` envelopes; other
/// control messages are written as they are. The task ends once both inputs
/// are closed or the writer fails.
pub fn spawn_control_writer<W>(
    mut writer: JsonDatagramWriter<W>,
    mut rpc_frames: mpsc::UnboundedReceiver<Value>,
    mut control: mpsc::UnboundedReceiver<ControlMessage>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut rpc_open = true;
        let mut control_open = true;
        while rpc_open || control_open {
            let envelope = tokio::select! {
                frame = rpc_frames.recv(), if rpc_open => match frame {
                    Some(data) => json!({ "type": "rpc", "data": data }),
                    None => { rpc_open = false; continue; }
                },
                msg = control.recv(), if control_open => match msg {
                    Some(msg) => match serde_json::to_value(&msg) {
                        Ok(v) => v,
                        Err(err) => {
                            warn!(error = %err, "failed to encode control message");
                            continue;
                        }
                    },
                    None => { control_open = false; continue; }
                },
            };
            if let Err(err) = writer.write(&envelope).await {
                warn!(error = %err, "control channel write failed");
                break;
            }
        }
        let _ = writer.end().await;
    })
}

/// Reads envelopes until end of stream. `rpc` frames go to `socket`; every
/// other recognised message is handed to `on_control`. The socket is closed
/// when the stream ends, so no call is left waiting on a dead peer.
pub async fn read_control<R, F>(
    mut reader: JsonDatagramReader<R>,
    socket: RpcSocket,
    mut on_control: F,
) where
    R: AsyncRead + Unpin,
    F: FnMut(ControlMessage),
{
    while let Some(next) = reader.recv().await {
        let value = match next {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "control channel read failed");
                break;
            }
        };
        match ControlMessage::parse(value) {
            Some(ControlMessage::Rpc { data }) => socket.handle_frame(data),
            Some(other) => on_control(other),
            None => {}
        }
    }
    socket.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_use_wire_names() {
        let ready = serde_json::to_value(ControlMessage::RpcReady { id: 3 }).unwrap();
        assert_eq!(ready, json!({"type": "rpc-ready", "id": 3}));

        let ws = ControlMessage::Websocket {
            cloud_id: "abc".into(),
            req: WebSocketRequest {
                http_version: "1.1".into(),
                url: "/ws/abc".into(),
                method: "GET".into(),
                headers: BTreeMap::new(),
            },
            upgrade_head: "".into(),
        };
        let v = serde_json::to_value(&ws).unwrap();
        assert_eq!(v["type"], "websocket");
        assert_eq!(v["cloudId"], "abc");
        assert_eq!(v["req"]["httpVersion"], "1.1");
        assert!(v.get("upgradeHead").is_some());

        let direct = serde_json::to_value(ControlMessage::Direct { target: 4, reply_id: "r".into() }).unwrap();
        assert_eq!(direct, json!({"type": "direct", "target": 4, "replyId": "r"}));
    }

    #[test]
    fn unknown_types_are_ignored() {
        assert!(ControlMessage::parse(json!({"type": "ready", "id": 1})).is_none());
        assert!(ControlMessage::parse(json!({"id": 1})).is_none());
        assert_eq!(
            ControlMessage::parse(json!({"type": "rpc", "data": {"id": 1, "reply": 2}})),
            Some(ControlMessage::Rpc { data: json!({"id": 1, "reply": 2}) })
        );
    }

    #[tokio::test]
    async fn writer_wraps_rpc_frames_and_reader_unwraps_them() {
        let (a, b) = tokio::io::duplex(4096);
        let (_a_read, a_write) = tokio::io::split(a);
        let (b_read, _b_write) = tokio::io::split(b);

        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let writer = spawn_control_writer(JsonDatagramWriter::new(a_write), rpc_rx, ctl_rx);

        ctl_tx.send(ControlMessage::RpcReady { id: 1 }).unwrap();
        rpc_tx.send(json!({"id": 5, "error": "nope"})).unwrap();
        drop(rpc_tx);
        drop(ctl_tx);
        writer.await.unwrap();

        let (socket, _out) = RpcSocket::new();
        let mut seen = Vec::new();
        read_control(JsonDatagramReader::new(b_read), socket.clone(), |m| seen.push(m)).await;
        assert_eq!(seen, vec![ControlMessage::RpcReady { id: 1 }]);
        assert!(socket.is_closed());
    }
}
