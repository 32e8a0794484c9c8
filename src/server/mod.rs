//! Server-side dispatch: binds a [`MethodResolver`] to a concrete
//! transport and accepts connections/datagrams for it (§4.7).

pub mod dispatcher;
pub mod pubsub;

pub use dispatcher::Dispatcher;
pub use pubsub::PubSubDispatcher;

use crate::error::RpcError;
use crate::resolver::MethodResolver;
use crate::transport::datagram::{DatagramClient, DatagramHandle};
use crate::transport::multicast::MulticastClient;
use crate::transport::stream::{accept_stream, tune_tcp_socket, StreamHandle};
use crate::transport::WaitTimeout;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Binds `addr` and spawns an accept loop that hands every incoming TCP
/// connection to its own connection task wired to `resolver`. Each
/// accepted `StreamHandle` is discarded here — the server only needs the
/// connection's task to be running, not a caller-facing handle — except
/// that pub/sub-style resolvers register it via `on_accept`.
pub async fn serve_stream<F>(
    addr: &str,
    resolver: Arc<dyn MethodResolver>,
    send_errors: bool,
    idle_timeout: WaitTimeout,
    mut on_accept: F,
) -> Result<JoinHandle<()>, RpcError>
where
    F: FnMut(StreamHandle) + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RpcError::Connection(e.to_string()))?;
    info!(addr, "listening for stream connections");

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "accepted stream connection");
                    let stream = match tune_tcp_socket(stream, 8192) {
                        Ok(stream) => stream,
                        Err(err) => {
                            error!(error = %err, "failed to tune accepted socket");
                            continue;
                        }
                    };
                    let handle = accept_stream(stream, resolver.clone(), send_errors, idle_timeout);
                    on_accept(handle);
                }
                Err(err) => {
                    error!(error = %err, "accept failed, stopping listener");
                    break;
                }
            }
        }
    }))
}

/// Binds a UDP socket on `bind_addr` and dispatches inbound requests to
/// `resolver`. Returns the handle immediately; there is no separate
/// accept loop since a datagram socket has no per-peer connection state.
pub async fn serve_datagram(
    bind_addr: &str,
    resolver: Arc<dyn MethodResolver>,
    send_errors: bool,
) -> Result<DatagramHandle, RpcError> {
    DatagramClient::unbound(bind_addr, Some(resolver), send_errors).await
}

/// Joins `group` on `port` and dispatches inbound requests to `resolver`.
pub async fn serve_multicast(
    group: Ipv4Addr,
    port: u16,
    ttl: u32,
    resolver: Arc<dyn MethodResolver>,
    send_errors: bool,
) -> Result<crate::transport::multicast::MulticastHandle, RpcError> {
    MulticastClient::join(group, port, ttl, Some(resolver), send_errors).await
}
