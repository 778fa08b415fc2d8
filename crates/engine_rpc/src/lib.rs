pub mod datagram;
pub mod control;
pub mod rpc;
pub mod lock;
pub mod worker;

pub use control::{ControlMessage, WebSocketRequest};
pub use datagram::{DatagramError, JsonDatagramReader, JsonDatagramSocket, JsonDatagramWriter};
pub use lock::{Lock, LockGuard};
pub use rpc::{RemoteHandle, RpcError, RpcSocket, RpcStub};
