//! Transport abstraction the engine drives bytes through.
//!
//! Generalizes the teacher's `IpcTransport` trait: instead of a fixed
//! `Message` struct, a transport here only ever moves raw encoded frame
//! bytes and an optional per-message peer context. Everything
//! msgpack-rpc-specific (framing, correlation, dispatch) lives in
//! `engine::Engine`.

pub mod datagram;
pub mod multicast;
pub mod stream;
pub mod tls;

use crate::error::RpcError;
use async_trait::async_trait;
use std::time::Duration;

/// What the engine needs from a transport: a way to write encoded frame
/// bytes, optionally addressed to a specific peer, and a liveness check.
#[async_trait]
pub trait Transport: Send {
    /// Per-message addressing context. `()` for stream transports (there
    /// is exactly one peer, the other end of the connection);
    /// `SocketAddr` for unconnected datagram/multicast transports.
    type Peer: Clone + Send + Sync + 'static;

    async fn send(&mut self, bytes: Vec<u8>, peer: Option<&Self::Peer>) -> Result<(), RpcError>;

    fn is_connected(&self) -> bool;
}

/// Bounds a connect attempt; `None` waits indefinitely.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    pub connect_timeout: Option<Duration>,
}

/// Idle timeout (stream) or per-request timeout (datagram). `None`
/// disables the timer entirely, per spec §8 boundary behavior.
pub type WaitTimeout = Option<Duration>;
