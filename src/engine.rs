//! Transport-agnostic request/response correlation and dispatch core.
//!
//! One `Engine` instance is owned exclusively by the task driving a single
//! connection (§5: "one actor per connection"), so its internal tables
//! need no lock of their own.

use crate::codec::Codec;
use crate::conn::{next_connection_id, ConnectionId};
use crate::error::RpcError;
use crate::message::{Frame, MsgIdAllocator};
use crate::resolver::{DispatchOutcome, MethodResolver};
use crate::transport::Transport;
use rmpv::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

struct PendingEntry<P> {
    sender: oneshot::Sender<Result<Value, RpcError>>,
    #[allow(dead_code)]
    peer: Option<P>,
}

/// Framing-agnostic correlation of requests/responses/notifications for
/// one connection, plus dispatch of inbound requests to a method
/// resolver.
pub struct Engine<T: Transport> {
    transport: T,
    codec: Codec,
    msgids: MsgIdAllocator,
    pending: HashMap<u32, PendingEntry<T::Peer>>,
    incoming: HashSet<u32>,
    resolver: Option<Arc<dyn MethodResolver>>,
    send_errors: bool,
    connection_id: ConnectionId,
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T, resolver: Option<Arc<dyn MethodResolver>>, send_errors: bool) -> Self {
        Engine {
            transport,
            codec: Codec::default(),
            msgids: MsgIdAllocator::new(),
            pending: HashMap::new(),
            incoming: HashSet::new(),
            resolver,
            send_errors,
            connection_id: next_connection_id(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Allocates the next msgid, encodes and sends a request, and returns
    /// that msgid alongside a receiver resolved exactly once with the
    /// eventual result or error. Fails immediately, without allocating a
    /// msgid (returned as `0`, never a real value since allocation starts
    /// at 1), if the transport reports not connected. The msgid is
    /// exposed so per-request-timer transports (datagram, multicast) can
    /// drive `complete_pending` on expiry without the engine needing to
    /// know about timers itself.
    pub async fn create_request(
        &mut self,
        method: &str,
        params: Value,
        peer: Option<T::Peer>,
    ) -> (u32, oneshot::Receiver<Result<Value, RpcError>>) {
        let (tx, rx) = oneshot::channel();

        if !self.transport.is_connected() {
            let _ = tx.send(Err(RpcError::Connection("not connected".to_string())));
            return (0, rx);
        }

        let msgid = self.msgids.next();
        let frame = Frame::request(msgid, method, params);
        let bytes = match self.codec.encode(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx.send(Err(err));
                return (0, rx);
            }
        };

        if let Err(err) = self.transport.send(bytes, peer.as_ref()).await {
            let _ = tx.send(Err(err));
            return (0, rx);
        }

        self.pending.insert(msgid, PendingEntry { sender: tx, peer });
        (msgid, rx)
    }

    /// Fire-and-forget; params are normalized to an array by `Frame`.
    /// Leaves no pending-table entry behind, even on success.
    pub async fn create_notification(
        &mut self,
        method: &str,
        params: Value,
        peer: Option<T::Peer>,
    ) -> Result<(), RpcError> {
        if !self.transport.is_connected() {
            return Err(RpcError::Connection("not connected".to_string()));
        }
        let frame = Frame::notification(method, params);
        let bytes = self.codec.encode(&frame)?;
        self.transport.send(bytes, peer.as_ref()).await
    }

    /// Feeds raw bytes to the codec and routes every fully decoded frame.
    /// A decode failure is not attributable to any single msgid, so it is
    /// returned to the caller rather than resolving a pending entry.
    pub async fn on_bytes(&mut self, bytes: &[u8], peer: Option<T::Peer>) -> Result<(), RpcError> {
        let frames = self.codec.feed(bytes)?;
        for frame in frames {
            self.route_frame(frame, peer.clone()).await;
        }
        Ok(())
    }

    async fn route_frame(&mut self, frame: Frame, peer: Option<T::Peer>) {
        match frame {
            Frame::Response { msgid, error, result } => {
                self.complete_pending(msgid, response_outcome(error, result));
            }
            Frame::Request { msgid, method, params } => {
                let params: Vec<Value> = params.as_slice().to_vec();
                self.handle_request(msgid, &method, params, peer).await;
            }
            Frame::Notification { method, params } => {
                let params: Vec<Value> = params.as_slice().to_vec();
                self.handle_notification(&method, params).await;
            }
        }
    }

    /// Resolves a pending request if `msgid` is still outstanding.
    /// Used both for ordinary response routing and by transports (e.g.
    /// datagram timers, multicast aggregation) that need to complete a
    /// pending entry outside of the normal response path. Returns `false`
    /// for an unknown msgid, which is the documented "late response"
    /// tolerance — dropped silently save for a debug log.
    pub fn complete_pending(&mut self, msgid: u32, outcome: Result<Value, RpcError>) -> bool {
        match self.pending.remove(&msgid) {
            Some(entry) => {
                let _ = entry.sender.send(outcome);
                true
            }
            None => {
                debug!(msgid, "dropping response for unknown msgid");
                false
            }
        }
    }

    /// Fails every outstanding pending request with `reason` and empties
    /// the pending table. Used on transport close.
    pub fn shutdown(&mut self, reason: RpcError) {
        for (_, entry) in self.pending.drain() {
            let _ = entry.sender.send(Err(reason.clone()));
        }
    }

    async fn handle_request(&mut self, msgid: u32, method: &str, params: Vec<Value>, peer: Option<T::Peer>) {
        if !self.incoming.insert(msgid) {
            let frame = Frame::response_err(msgid, Value::from("duplicate msgid"));
            self.reply(frame, peer).await;
            return;
        }

        let outcome = match &self.resolver {
            Some(resolver) => {
                resolver
                    .dispatch_request(self.connection_id, msgid, method, &params)
                    .await
            }
            None => DispatchOutcome::UnknownMethod,
        };

        self.incoming.remove(&msgid);

        let frame = match outcome {
            DispatchOutcome::Result(value) => Frame::response_ok(msgid, value),
            DispatchOutcome::UserError(value) => Frame::response_err(msgid, value),
            DispatchOutcome::UnknownMethod => {
                Frame::response_err(msgid, Value::from(format!("unknown method: {method}")))
            }
            DispatchOutcome::WrongArity => {
                let detail = if self.send_errors {
                    format!("wrong arity for method: {method}")
                } else {
                    "invalid request".to_string()
                };
                Frame::response_err(msgid, Value::from(detail))
            }
        };

        self.reply(frame, peer).await;
    }

    async fn handle_notification(&mut self, method: &str, params: Vec<Value>) {
        if let Some(resolver) = &self.resolver {
            resolver
                .dispatch_notification(self.connection_id, method, &params)
                .await;
        }
    }

    async fn reply(&mut self, frame: Frame, peer: Option<T::Peer>) {
        let msgid = match &frame {
            Frame::Response { msgid, .. } => *msgid,
            _ => return,
        };

        let bytes = match self.codec.encode(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "encoding response failed, retrying with encoder-error payload");
                let retry = Frame::response_err(msgid, Value::from(err.to_string()));
                match self.codec.encode(&retry) {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        error!("failed to encode error response twice, dropping connection");
                        return;
                    }
                }
            }
        };

        if let Err(err) = self.transport.send(bytes, peer.as_ref()).await {
            warn!(error = %err, "failed to send response");
        }
    }
}

fn response_outcome(error: Value, result: Value) -> Result<Value, RpcError> {
    if matches!(error, Value::Nil) {
        Ok(result)
    } else {
        Err(RpcError::response(error))
    }
}
