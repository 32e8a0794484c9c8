//! Datagram transport: UDP unicast, connected or unconnected.
//!
//! Unlike the stream transport there is no connection-level liveness, so
//! timeouts are per-request (§4.4) rather than a single idle timer: each
//! outbound request arms its own timer, canceled implicitly by the
//! response arriving first (the timer firing after completion is a
//! harmless no-op against the pending table).

use crate::conn::ConnectionId;
use crate::engine::Engine;
use crate::error::RpcError;
use crate::resolver::MethodResolver;
use crate::transport::{ConnectOptions, Transport, WaitTimeout};
use async_trait::async_trait;
use rmpv::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// `None` when the socket is connected to a single remote peer (no
/// per-message address needed); `Some` otherwise.
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
    connected_peer: Option<SocketAddr>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for DatagramTransport {
    type Peer = SocketAddr;

    async fn send(&mut self, bytes: Vec<u8>, peer: Option<&SocketAddr>) -> Result<(), RpcError> {
        let result = match (peer, self.connected_peer) {
            (Some(addr), _) => self.socket.send_to(&bytes, addr).await.map(|_| ()),
            (None, Some(_)) => self.socket.send(&bytes).await.map(|_| ()),
            (None, None) => {
                return Err(RpcError::Connection(
                    "datagram transport has no destination: pass a peer or connect it".to_string(),
                ))
            }
        };
        result.map_err(|e| RpcError::Connection(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

enum DatagramCommand {
    Request {
        method: String,
        params: Value,
        peer: Option<SocketAddr>,
        wait_timeout: WaitTimeout,
        respond_to: oneshot::Sender<oneshot::Receiver<Result<Value, RpcError>>>,
    },
    Notify {
        method: String,
        params: Value,
        peer: Option<SocketAddr>,
        respond_to: oneshot::Sender<Result<(), RpcError>>,
    },
    TimerFired(u32),
    Disconnect,
}

#[derive(Clone)]
pub struct DatagramHandle {
    cmd_tx: mpsc::Sender<DatagramCommand>,
    connection_id: ConnectionId,
    connected: Arc<AtomicBool>,
}

impl DatagramHandle {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// `peer` is required when the underlying socket is unconnected;
    /// ignored (may be `None`) when it was created with `connect`.
    pub async fn create_request(
        &self,
        method: &str,
        params: Value,
        peer: Option<SocketAddr>,
        wait_timeout: WaitTimeout,
    ) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(DatagramCommand::Request {
                method: method.to_string(),
                params,
                peer,
                wait_timeout,
                respond_to: tx,
            })
            .await
            .map_err(|_| RpcError::Connection("connection task gone".to_string()))?;
        let completion = rx
            .await
            .map_err(|_| RpcError::Connection("connection task gone".to_string()))?;
        completion
            .await
            .map_err(|_| RpcError::Connection("connection closed before response".to_string()))?
    }

    pub async fn create_notification(
        &self,
        method: &str,
        params: Value,
        peer: Option<SocketAddr>,
    ) -> Result<(), RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(DatagramCommand::Notify {
                method: method.to_string(),
                params,
                peer,
                respond_to: tx,
            })
            .await
            .map_err(|_| RpcError::Connection("connection task gone".to_string()))?;
        rx.await
            .map_err(|_| RpcError::Connection("connection task gone".to_string()))?
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(DatagramCommand::Disconnect).await;
    }
}

const RECV_BUFFER: usize = 64 * 1024;

async fn run(
    mut engine: Engine<DatagramTransport>,
    socket: Arc<UdpSocket>,
    connected_peer: Option<SocketAddr>,
    cmd_tx: mpsc::Sender<DatagramCommand>,
    mut cmd_rx: mpsc::Receiver<DatagramCommand>,
    connected: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((n, from)) => {
                        let peer = connected_peer.unwrap_or(from);
                        if let Err(err) = engine.on_bytes(&buf[..n], Some(peer)).await {
                            warn!(error = %err, "discarding malformed datagram");
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                        warn!("datagram peer refused connection, failing pending requests");
                        engine.shutdown(RpcError::Connection("connection refused".to_string()));
                    }
                    Err(err) => {
                        warn!(error = %err, "datagram recv error");
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(DatagramCommand::Request { method, params, peer, wait_timeout, respond_to }) => {
                        let (msgid, rx) = engine.create_request(&method, params, peer).await;
                        if msgid != 0 {
                            if let Some(duration) = wait_timeout {
                                arm_timer(cmd_tx.clone(), msgid, duration);
                            }
                        }
                        let _ = respond_to.send(rx);
                    }
                    Some(DatagramCommand::Notify { method, params, peer, respond_to }) => {
                        let result = engine.create_notification(&method, params, peer).await;
                        let _ = respond_to.send(result);
                    }
                    Some(DatagramCommand::TimerFired(msgid)) => {
                        let _ = engine.complete_pending(msgid, Err(RpcError::Timeout));
                    }
                    Some(DatagramCommand::Disconnect) | None => break,
                }
            }
        }
    }

    connected.store(false, Ordering::Release);
    engine.shutdown(RpcError::Connection("connection closed".to_string()));
}

/// Spawns a one-shot task that, after `duration`, feeds a `TimerFired`
/// command back into the connection's own command queue so the expiry
/// is handled on the same task that owns the engine. Firing after the
/// response already arrived is a harmless no-op (`complete_pending`
/// reports a missing msgid silently).
fn arm_timer(cmd_tx: mpsc::Sender<DatagramCommand>, msgid: u32, duration: std::time::Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        let _ = cmd_tx.send(DatagramCommand::TimerFired(msgid)).await;
    });
}

fn spawn(
    socket: UdpSocket,
    connected_peer: Option<SocketAddr>,
    resolver: Option<Arc<dyn MethodResolver>>,
    send_errors: bool,
) -> DatagramHandle {
    let connected = Arc::new(AtomicBool::new(true));
    let socket = Arc::new(socket);
    let transport = DatagramTransport {
        socket: socket.clone(),
        connected_peer,
        connected: connected.clone(),
    };
    let engine = Engine::new(transport, resolver, send_errors);
    let connection_id = engine.connection_id();
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    tokio::spawn(run(
        engine,
        socket,
        connected_peer,
        cmd_tx.clone(),
        cmd_rx,
        connected.clone(),
    ));

    DatagramHandle {
        cmd_tx,
        connection_id,
        connected,
    }
}

pub struct DatagramClient;

impl DatagramClient {
    /// Binds an ephemeral local socket and connects it to `addr`: every
    /// send/receive is implicitly addressed to that single peer.
    pub async fn connect(
        addr: &str,
        opts: ConnectOptions,
        resolver: Option<Arc<dyn MethodResolver>>,
    ) -> Result<DatagramHandle, RpcError> {
        let socket = bind_ephemeral().await?;
        let connect_fut = socket.connect(addr);
        match opts.connect_timeout {
            Some(d) => tokio::time::timeout(d, connect_fut)
                .await
                .map_err(|_| RpcError::Connection("connect timed out".to_string()))?
                .map_err(|e| RpcError::Connection(e.to_string()))?,
            None => connect_fut
                .await
                .map_err(|e| RpcError::Connection(e.to_string()))?,
        };
        let peer = socket
            .peer_addr()
            .map_err(|e| RpcError::Connection(e.to_string()))?;
        Ok(spawn(socket, Some(peer), resolver, false))
    }

    /// Binds an unconnected local socket; every request must carry an
    /// explicit destination peer.
    pub async fn unbound(
        bind_addr: &str,
        resolver: Option<Arc<dyn MethodResolver>>,
        send_errors: bool,
    ) -> Result<DatagramHandle, RpcError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))?;
        Ok(spawn(socket, None, resolver, send_errors))
    }
}

async fn bind_ephemeral() -> Result<UdpSocket, RpcError> {
    UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| RpcError::Connection(e.to_string()))
}
