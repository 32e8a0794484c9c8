//! Publish/subscribe extension over a [`Dispatcher`].
//!
//! Adds the `subscribe`/`unsubscribe` built-ins and a server-internal
//! `publish` operation. The subscriber table is a `DashMap` keyed by
//! topic, grounded in the concurrently-mutated routing table pattern in
//! `examples/slightknack-isocore/crates/exorun/src/runtime.rs`
//! (`peers: DashMap<PeerId, Arc<Peer>>`) — publish can run concurrently
//! with another connection's subscribe/unsubscribe call.

use crate::conn::ConnectionId;
use crate::resolver::{DispatchOutcome, MethodResolver, RemoteMethod};
use crate::transport::stream::StreamHandle;
use async_trait::async_trait;
use dashmap::DashMap;
use rmpv::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::dispatcher::Dispatcher;

/// A notification queued for delivery to one connection by `publish`.
pub struct Publication {
    pub topic: String,
    pub params: Value,
}

/// Wraps a `Dispatcher`, adding subscription bookkeeping. Each connection
/// that wants to receive publications registers an outbound channel via
/// [`PubSubDispatcher::register_connection`] when it starts, and
/// deregisters on close.
pub struct PubSubDispatcher {
    inner: Dispatcher,
    topics: DashMap<String, HashSet<ConnectionId>>,
    peers: DashMap<ConnectionId, mpsc::UnboundedSender<Publication>>,
}

impl Default for PubSubDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubDispatcher {
    pub fn new() -> Self {
        PubSubDispatcher {
            inner: Dispatcher::new(),
            topics: DashMap::new(),
            peers: DashMap::new(),
        }
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.inner
    }

    pub fn register_connection(&self, conn: ConnectionId, sender: mpsc::UnboundedSender<Publication>) {
        self.peers.insert(conn, sender);
    }

    /// Removes a connection from every topic it was subscribed to. Called
    /// when the connection closes.
    pub fn remove_connection(&self, conn: ConnectionId) {
        self.peers.remove(&conn);
        for mut entry in self.topics.iter_mut() {
            entry.value_mut().remove(&conn);
        }
    }

    /// Inserts `conn` into the subscriber set for `topic`. A second
    /// subscription by the same connection is a silent no-op (dedup, see
    /// DESIGN.md Open Question decisions).
    pub fn subscribe(&self, conn: ConnectionId, topic: &str) {
        self.topics.entry(topic.to_string()).or_default().insert(conn);
    }

    /// Removes `conn` from `topic`'s subscriber set. Unsubscribing from a
    /// topic the connection was never subscribed to is a silent success.
    pub fn unsubscribe(&self, conn: ConnectionId, topic: &str) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(&conn);
        }
    }

    /// Delivers `params` as a notification to every subscriber of `topic`
    /// present at the moment publish starts. A subscriber whose outbound
    /// channel is gone (connection closed) is removed from the topic set;
    /// new subscribers added during the iteration are not guaranteed to
    /// receive this publication.
    pub fn publish(&self, topic: &str, params: Value) {
        let snapshot: Vec<ConnectionId> = match self.topics.get(topic) {
            Some(subscribers) => subscribers.iter().copied().collect(),
            None => return,
        };

        for conn in snapshot {
            let delivered = match self.peers.get(&conn) {
                Some(sender) => sender
                    .send(Publication {
                        topic: topic.to_string(),
                        params: params.clone(),
                    })
                    .is_ok(),
                None => false,
            };

            if !delivered {
                debug!(conn, topic, "dropping dead subscriber from topic set");
                if let Some(mut subscribers) = self.topics.get_mut(topic) {
                    subscribers.remove(&conn);
                }
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|set| set.len()).unwrap_or(0)
    }

    /// Registers `handle`'s connection for delivery and spawns the task
    /// that forwards queued publications to it as plain notifications
    /// (§4.7: "attempting to deliver a notification ... to each").
    /// Deregisters automatically when the handle disconnects or the
    /// dispatcher itself is dropped.
    pub fn spawn_delivery(self: &Arc<Self>, handle: StreamHandle) {
        let conn = handle.connection_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.register_connection(conn, tx);

        let pubsub = self.clone();
        tokio::spawn(async move {
            while let Some(publication) = rx.recv().await {
                if handle
                    .create_notification(&publication.topic, publication.params)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            pubsub.remove_connection(conn);
        });
    }
}

#[async_trait]
impl MethodResolver for PubSubDispatcher {
    async fn dispatch_request(
        &self,
        conn: ConnectionId,
        msgid: u32,
        method: &str,
        params: &[Value],
    ) -> DispatchOutcome {
        match method {
            "subscribe" => match params.first().and_then(Value::as_str) {
                Some(topic) => {
                    self.subscribe(conn, topic);
                    DispatchOutcome::Result(Value::from(0))
                }
                None => DispatchOutcome::WrongArity,
            },
            "unsubscribe" => match params.first().and_then(Value::as_str) {
                Some(topic) => {
                    self.unsubscribe(conn, topic);
                    DispatchOutcome::Result(Value::from(0))
                }
                None => DispatchOutcome::WrongArity,
            },
            _ => self.inner.dispatch_request(conn, msgid, method, params).await,
        }
    }

    async fn dispatch_notification(&self, conn: ConnectionId, method: &str, params: &[Value]) {
        self.inner.dispatch_notification(conn, method, params).await
    }
}
