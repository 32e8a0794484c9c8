//! Multicast transport.
//!
//! Joins a UDP multicast group and sends requests to `(group, port)`;
//! because more than one peer may reply to the same msgid, this
//! transport does not reuse the generic [`crate::engine::Engine`] — its
//! pending table resolves each msgid exactly once on first response,
//! which does not fit "collect every response that arrives within a
//! window" (§4.5). Instead it composes the [`crate::codec::Codec`] and
//! [`crate::resolver::MethodResolver`] directly around its own
//! per-msgid aggregate buffer and window timer.

use crate::codec::Codec;
use crate::conn::{next_connection_id, ConnectionId};
use crate::error::RpcError;
use crate::message::{Frame, MsgIdAllocator};
use crate::resolver::{DispatchOutcome, MethodResolver};
use rmpv::Value;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// One request's in-flight collection of replies, in arrival order.
struct Aggregate {
    responses: Vec<Value>,
    sender: Option<oneshot::Sender<Result<Value, RpcError>>>,
}

enum MulticastCommand {
    Request {
        method: String,
        params: Value,
        window: Duration,
        respond_to: oneshot::Sender<oneshot::Receiver<Result<Value, RpcError>>>,
    },
    WindowElapsed(u32),
    Disconnect,
}

#[derive(Clone)]
pub struct MulticastHandle {
    cmd_tx: mpsc::Sender<MulticastCommand>,
}

impl MulticastHandle {
    /// `window` bounds how long responses are collected before the
    /// completion resolves with whatever arrived (or a timeout error if
    /// nothing did).
    pub async fn create_request(
        &self,
        method: &str,
        params: Value,
        window: Duration,
    ) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(MulticastCommand::Request {
                method: method.to_string(),
                params,
                window,
                respond_to: tx,
            })
            .await
            .map_err(|_| RpcError::Connection("multicast task gone".to_string()))?;
        let completion = rx
            .await
            .map_err(|_| RpcError::Connection("multicast task gone".to_string()))?;
        completion
            .await
            .map_err(|_| RpcError::Connection("multicast transport closed".to_string()))?
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(MulticastCommand::Disconnect).await;
    }
}

const RECV_BUFFER: usize = 64 * 1024;

async fn run(
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    resolver: Option<Arc<dyn MethodResolver>>,
    send_errors: bool,
    connection_id: ConnectionId,
    cmd_tx: mpsc::Sender<MulticastCommand>,
    mut cmd_rx: mpsc::Receiver<MulticastCommand>,
) {
    let mut msgids = MsgIdAllocator::new();
    let mut pending: HashMap<u32, Aggregate> = HashMap::new();
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                match recv {
                    Ok((n, from)) => {
                        handle_datagram(
                            &buf[..n],
                            from,
                            &socket,
                            &resolver,
                            send_errors,
                            connection_id,
                            &mut pending,
                        )
                        .await;
                    }
                    Err(err) => warn!(error = %err, "multicast recv error"),
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(MulticastCommand::Request { method, params, window, respond_to }) => {
                        let (tx, rx) = oneshot::channel();
                        let msgid = msgids.next();
                        let frame = Frame::request(msgid, &method, params);
                        let codec = Codec::default();
                        match codec.encode(&frame) {
                            Ok(bytes) => {
                                if let Err(err) = socket.send_to(&bytes, group).await {
                                    let _ = tx.send(Err(RpcError::Connection(err.to_string())));
                                } else {
                                    pending.insert(msgid, Aggregate { responses: Vec::new(), sender: Some(tx) });
                                    arm_window(cmd_tx.clone(), msgid, window);
                                }
                            }
                            Err(err) => {
                                let _ = tx.send(Err(err));
                            }
                        }
                        let _ = respond_to.send(rx);
                    }
                    Some(MulticastCommand::WindowElapsed(msgid)) => {
                        if let Some(mut agg) = pending.remove(&msgid) {
                            let outcome = if agg.responses.is_empty() {
                                Err(RpcError::Timeout)
                            } else {
                                Ok(Value::Array(std::mem::take(&mut agg.responses)))
                            };
                            if let Some(sender) = agg.sender.take() {
                                let _ = sender.send(outcome);
                            }
                        }
                    }
                    Some(MulticastCommand::Disconnect) | None => break,
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_datagram(
    bytes: &[u8],
    from: SocketAddr,
    socket: &Arc<UdpSocket>,
    resolver: &Option<Arc<dyn MethodResolver>>,
    _send_errors: bool,
    connection_id: ConnectionId,
    pending: &mut HashMap<u32, Aggregate>,
) {
    let mut codec = Codec::default();
    let frames = match codec.feed(bytes) {
        Ok(frames) => frames,
        Err(err) => {
            warn!(error = %err, "discarding malformed multicast datagram");
            return;
        }
    };

    for frame in frames {
        match frame {
            Frame::Response { msgid, error, result } => {
                if let Some(agg) = pending.get_mut(&msgid) {
                    let value = if matches!(error, Value::Nil) { result } else { error };
                    agg.responses.push(value);
                } else {
                    // late arrival after the window elapsed; documented drop.
                }
            }
            Frame::Request { msgid, method, params } => {
                let Some(resolver) = resolver else { continue };
                let args: Vec<Value> = params.as_slice().to_vec();
                let outcome = resolver
                    .dispatch_request(connection_id, msgid, &method, &args)
                    .await;
                let reply = match outcome {
                    DispatchOutcome::Result(value) => Frame::response_ok(msgid, value),
                    DispatchOutcome::UserError(value) => Frame::response_err(msgid, value),
                    DispatchOutcome::UnknownMethod => {
                        Frame::response_err(msgid, Value::from(format!("unknown method: {method}")))
                    }
                    DispatchOutcome::WrongArity => {
                        Frame::response_err(msgid, Value::from("invalid request"))
                    }
                };
                let encode_codec = Codec::default();
                if let Ok(bytes) = encode_codec.encode(&reply) {
                    if let Err(err) = socket.send_to(&bytes, from).await {
                        warn!(error = %err, "failed to send multicast reply");
                    }
                }
            }
            Frame::Notification { method, params } => {
                if let Some(resolver) = resolver {
                    let args: Vec<Value> = params.as_slice().to_vec();
                    resolver.dispatch_notification(connection_id, &method, &args).await;
                }
            }
        }
    }
}

fn arm_window(cmd_tx: mpsc::Sender<MulticastCommand>, msgid: u32, window: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(window).await;
        let _ = cmd_tx.send(MulticastCommand::WindowElapsed(msgid)).await;
    });
}

pub struct MulticastClient;

impl MulticastClient {
    /// Joins `group` (an IPv4 multicast address) on `port` with hop
    /// limit `ttl`. `resolver` is optional: a pure client that never
    /// answers inbound requests passes `None`.
    pub async fn join(
        group: Ipv4Addr,
        port: u16,
        ttl: u32,
        resolver: Option<Arc<dyn MethodResolver>>,
        send_errors: bool,
    ) -> Result<MulticastHandle, RpcError> {
        let socket = build_multicast_socket(group, port, ttl)?;
        let socket = Arc::new(socket);
        let group_addr = SocketAddr::V4(SocketAddrV4::new(group, port));
        let connection_id = next_connection_id();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        tokio::spawn(run(
            socket,
            group_addr,
            resolver,
            send_errors,
            connection_id,
            cmd_tx.clone(),
            cmd_rx,
        ));

        Ok(MulticastHandle { cmd_tx })
    }
}

fn build_multicast_socket(group: Ipv4Addr, port: u16, ttl: u32) -> Result<UdpSocket, RpcError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| RpcError::Connection(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| RpcError::Connection(e.to_string()))?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&bind_addr.into())
        .map_err(|e| RpcError::Connection(e.to_string()))?;
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| RpcError::Connection(e.to_string()))?;
    socket
        .set_multicast_ttl_v4(ttl)
        .map_err(|e| RpcError::Connection(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| RpcError::Connection(e.to_string()))?;
    UdpSocket::from_std(socket.into()).map_err(|e| RpcError::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::dispatcher::Dispatcher;

    #[tokio::test]
    async fn two_responders_are_both_collected_within_the_window() {
        let group: Ipv4Addr = "239.1.2.3".parse().unwrap();
        let port = 17891;

        let mut dispatcher_a = Dispatcher::new();
        dispatcher_a.register_fn("echo", Some(1), false, |_conn, _msgid, params| {
            let value = params[0].clone();
            async move { Ok(value) }
        });
        let resolver_a: Arc<dyn MethodResolver> = Arc::new(dispatcher_a);
        let _server_a = MulticastClient::join(group, port, 1, Some(resolver_a), false)
            .await
            .unwrap();

        let mut dispatcher_b = Dispatcher::new();
        dispatcher_b.register_fn("echo", Some(1), false, |_conn, _msgid, params| {
            let value = params[0].clone();
            async move { Ok(value) }
        });
        let resolver_b: Arc<dyn MethodResolver> = Arc::new(dispatcher_b);
        let _server_b = MulticastClient::join(group, port, 1, Some(resolver_b), false)
            .await
            .unwrap();

        let client = MulticastClient::join(group, port, 1, None, false).await.unwrap();

        let result = client
            .create_request("echo", Value::from("hi"), Duration::from_millis(500))
            .await
            .unwrap();
        let responses = result.as_array().unwrap();
        assert_eq!(responses.len(), 2);
        for value in responses {
            assert_eq!(value.as_str(), Some("hi"));
        }
    }

    #[tokio::test]
    async fn no_responders_resolves_as_timeout() {
        let group: Ipv4Addr = "239.1.2.4".parse().unwrap();
        let client = MulticastClient::join(group, 17892, 1, None, false)
            .await
            .unwrap();

        let result = client
            .create_request("echo", Value::from("hi"), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(RpcError::Timeout)));
    }
}
