//! Child side of the engine process protocol.
//!
//! A worker reads control envelopes from its input, serves RPC calls against
//! the stubs it registers, and announces its root stub with a single
//! `rpc-ready` message. Stdout is the protocol channel, so diagnostics must go
//! to stderr.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

use crate::control::{ControlMessage, read_control, spawn_control_writer};
use crate::datagram::{JsonDatagramReader, JsonDatagramWriter};
use crate::rpc::{RpcSocket, RpcStub};

/// Everything a worker's root object needs to talk back to the supervisor.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    pub socket: RpcSocket,
    control: mpsc::UnboundedSender<ControlMessage>,
}

impl WorkerContext {
    /// Sends a non-RPC control message to the supervisor.
    pub fn send_control(&self, msg: ControlMessage) -> bool {
        self.control.send(msg).is_ok()
    }
}

/// Runs a worker over `reader`/`writer` until the supervisor closes the
/// channel.
///
/// `make_root` builds the root stub once the socket exists; its id is what
/// the supervisor receives in the handshake. Control messages other than RPC
/// frames are passed to `on_control`.
pub async fn serve<R, W, M, F>(reader: R, writer: W, make_root: M, mut on_control: F)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    M: FnOnce(WorkerContext) -> Arc<dyn RpcStub>,
    F: FnMut(&WorkerContext, ControlMessage),
{
    let (socket, rpc_frames) = RpcSocket::new();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let writer_task = spawn_control_writer(JsonDatagramWriter::new(writer), rpc_frames, control_rx);

    let ctx = WorkerContext { socket: socket.clone(), control: control_tx };
    let root_id = socket.add_stub(make_root(ctx.clone()));
    ctx.send_control(ControlMessage::RpcReady { id: root_id });

    read_control(JsonDatagramReader::new(reader), socket, |msg| on_control(&ctx, msg)).await;
    debug!("supervisor closed the control channel");

    drop(ctx);
    let _ = writer_task.await;
}

/// [`serve`] over the process's own stdin and stdout.
pub async fn serve_stdio<M, F>(make_root: M, on_control: F)
where
    M: FnOnce(WorkerContext) -> Arc<dyn RpcStub>,
    F: FnMut(&WorkerContext, ControlMessage),
{
    serve(tokio::io::stdin(), tokio::io::stdout(), make_root, on_control).await
}
