//! Stream transport: TCP, TLS-over-TCP, and UNIX domain stream sockets.
//!
//! `StreamTransport<W>` is generic over the write half of any
//! `AsyncWrite + Unpin + Send` stream, so the same engine plumbing serves
//! all three concrete streams (§4.3). The read half is driven separately
//! by [`spawn`], which owns the `Engine` exclusively for the lifetime of
//! the connection — the "one task per connection" instantiation of the
//! concurrency model in §5.

use crate::conn::ConnectionId;
use crate::engine::Engine;
use crate::error::RpcError;
use crate::resolver::MethodResolver;
use crate::transport::tls::TlsOptions;
use crate::transport::{ConnectOptions, Transport, WaitTimeout};
use async_trait::async_trait;
use rmpv::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

pub struct StreamTransport<W> {
    writer: W,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transport for StreamTransport<W> {
    type Peer = ();

    async fn send(&mut self, bytes: Vec<u8>, _peer: Option<&()>) -> Result<(), RpcError> {
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

enum StreamCommand {
    Request {
        method: String,
        params: Value,
        respond_to: oneshot::Sender<oneshot::Receiver<Result<Value, RpcError>>>,
    },
    Notify {
        method: String,
        params: Value,
        respond_to: oneshot::Sender<Result<(), RpcError>>,
    },
    Disconnect,
}

/// A live stream connection's caller-facing handle. Cloning is cheap
/// (it's a channel sender); every clone talks to the same connection
/// task.
#[derive(Clone)]
pub struct StreamHandle {
    cmd_tx: mpsc::Sender<StreamCommand>,
    connection_id: ConnectionId,
    connected: Arc<AtomicBool>,
}

impl StreamHandle {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub async fn create_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(StreamCommand::Request {
                method: method.to_string(),
                params,
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

    pub async fn create_notification(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(StreamCommand::Notify {
                method: method.to_string(),
                params,
                respond_to: tx,
            })
            .await
            .map_err(|_| RpcError::Connection("connection task gone".to_string()))?;
        rx.await
            .map_err(|_| RpcError::Connection("connection task gone".to_string()))?
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(StreamCommand::Disconnect).await;
    }
}

/// Drives one stream connection: alternates between reading bytes,
/// servicing caller commands, and the idle timer, all inside a single
/// task so the engine's tables need no lock.
async fn run<R, W>(
    mut engine: Engine<StreamTransport<W>>,
    mut reader: R,
    mut cmd_rx: mpsc::Receiver<StreamCommand>,
    idle_timeout: WaitTimeout,
    connected: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; 8192];
    let mut deadline = idle_timeout.map(|d| Instant::now() + d);

    loop {
        let sleep = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("stream closed by peer");
                        break;
                    }
                    Ok(n) => {
                        if let Some(d) = idle_timeout {
                            deadline = Some(Instant::now() + d);
                        }
                        if let Err(err) = engine.on_bytes(&buf[..n], None).await {
                            warn!(error = %err, "decode failure, closing connection");
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "stream read error, closing connection");
                        break;
                    }
                }
            }
            _ = sleep => {
                warn!("idle timeout expired, closing connection");
                engine.shutdown(RpcError::Timeout);
                connected.store(false, Ordering::Release);
                return;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(StreamCommand::Request { method, params, respond_to }) => {
                        let (_msgid, rx) = engine.create_request(&method, params, None).await;
                        let _ = respond_to.send(rx);
                    }
                    Some(StreamCommand::Notify { method, params, respond_to }) => {
                        let result = engine.create_notification(&method, params, None).await;
                        let _ = respond_to.send(result);
                    }
                    Some(StreamCommand::Disconnect) | None => break,
                }
            }
        }
    }

    connected.store(false, Ordering::Release);
    engine.shutdown(RpcError::Connection("connection closed".to_string()));
}

fn spawn<R, W>(
    stream_writer: W,
    reader: R,
    resolver: Option<Arc<dyn MethodResolver>>,
    send_errors: bool,
    idle_timeout: WaitTimeout,
) -> StreamHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let connected = Arc::new(AtomicBool::new(true));
    let transport = StreamTransport {
        writer: stream_writer,
        connected: connected.clone(),
    };
    let engine = Engine::new(transport, resolver, send_errors);
    let connection_id = engine.connection_id();
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    tokio::spawn(run(engine, reader, cmd_rx, idle_timeout, connected.clone()));

    StreamHandle {
        cmd_tx,
        connection_id,
        connected,
    }
}

/// Tunes `TCP_NODELAY` and socket buffer sizes, following the teacher's
/// `tcp_socket.rs::start_client` into-std/clone/from-std dance (tokio
/// gives no direct setsockopt access on a live `TcpStream`).
pub(crate) fn tune_tcp_socket(stream: TcpStream, buffer_size: usize) -> Result<TcpStream, RpcError> {
    let std_stream = stream
        .into_std()
        .map_err(|e| RpcError::Connection(e.to_string()))?;
    let socket = socket2::Socket::from(
        std_stream
            .try_clone()
            .map_err(|e| RpcError::Connection(e.to_string()))?,
    );
    socket
        .set_nodelay(true)
        .map_err(|e| RpcError::Connection(e.to_string()))?;
    let _ = socket.set_recv_buffer_size(buffer_size);
    let _ = socket.set_send_buffer_size(buffer_size);
    TcpStream::from_std(std_stream).map_err(|e| RpcError::Connection(e.to_string()))
}

/// Namespace for the stream transport's client-side connect functions.
/// `StreamTransport<W>` itself is parameterized over the write half in
/// use and is constructed internally by [`spawn`]; callers only ever see
/// the resulting [`StreamHandle`].
pub struct StreamClient;

impl StreamClient {
    /// Connects to `addr` over plain TCP. Socket tuning (`TCP_NODELAY`,
    /// buffer sizes) follows the teacher's `tcp_socket.rs::start_client`.
    pub async fn connect_tcp(
        addr: &str,
        opts: ConnectOptions,
        resolver: Option<Arc<dyn MethodResolver>>,
        idle_timeout: WaitTimeout,
    ) -> Result<StreamHandle, RpcError> {
        let stream = connect_with_timeout(TcpStream::connect(addr), opts).await?;
        let stream = tune_tcp_socket(stream, 8192)?;
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(spawn(write_half, read_half, resolver, false, idle_timeout))
    }

    #[cfg(unix)]
    pub async fn connect_unix(
        path: &str,
        opts: ConnectOptions,
        resolver: Option<Arc<dyn MethodResolver>>,
        idle_timeout: WaitTimeout,
    ) -> Result<StreamHandle, RpcError> {
        let stream = connect_with_timeout(UnixStream::connect(path), opts).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(spawn(write_half, read_half, resolver, false, idle_timeout))
    }

    pub async fn connect_tls(
        addr: &str,
        domain: &str,
        opts: ConnectOptions,
        tls_opts: TlsOptions,
        resolver: Option<Arc<dyn MethodResolver>>,
        idle_timeout: WaitTimeout,
    ) -> Result<StreamHandle, RpcError> {
        let tcp = connect_with_timeout(TcpStream::connect(addr), opts).await?;
        let tcp = tune_tcp_socket(tcp, 8192)?;

        let config = tls_opts.build_client_config()?;
        let connector = tokio_rustls::TlsConnector::from(config);
        let server_name = rustls::pki_types::ServerName::try_from(domain.to_string())
            .map_err(|e| RpcError::Connection(e.to_string()))?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))?;

        let (read_half, write_half) = tokio::io::split(tls_stream);
        Ok(spawn(write_half, read_half, resolver, false, idle_timeout))
    }
}

async fn connect_with_timeout<F, T>(fut: F, opts: ConnectOptions) -> Result<T, RpcError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    let result = match opts.connect_timeout {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| RpcError::Connection("connect timed out".to_string()))?,
        None => fut.await,
    };
    result.map_err(|e| RpcError::Connection(e.to_string()))
}

/// Accepts one already-established stream (server side) and spawns its
/// connection task, registering `resolver` so inbound requests dispatch
/// immediately.
pub fn accept_stream<S>(
    stream: S,
    resolver: Arc<dyn MethodResolver>,
    send_errors: bool,
    idle_timeout: WaitTimeout,
) -> StreamHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    spawn(write_half, read_half, Some(resolver), send_errors, idle_timeout)
}
