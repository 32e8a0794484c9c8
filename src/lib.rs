//! # tokio-msgrpc
//!
//! A bidirectional MessagePack-RPC runtime: request/response/notification
//! framing and dispatch over stream (TCP/TLS/UNIX) and datagram
//! (UDP unicast/multicast) transports, with client-side connection
//! management (reconnect, pooling) and a server-side dispatcher with a
//! publish/subscribe extension.

pub mod client;
pub mod codec;
pub mod conn;
pub mod engine;
pub mod error;
pub mod message;
pub mod resolver;
pub mod server;
pub mod transport;

pub use conn::ConnectionId;
pub use engine::Engine;
pub use error::{RpcError, Result};
pub use message::Frame;
pub use resolver::{DispatchOutcome, MethodResolver, NullResolver, RemoteMethod};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
