//! Single-connection client handler with automatic reconnection (§4.6).
//!
//! Presents a stable facade over a connection that may be absent,
//! connecting, or lost. Callers issuing `create_request`/
//! `create_notification` while disconnected queue on a waiter set and
//! resolve once a connection appears, as long as the supervisor is
//! still within its retry budget; they only fail immediately once the
//! handler has stopped or the retry budget is exhausted.

use crate::client::reconnect::ReconnectPolicy;
use crate::error::RpcError;
use crate::transport::stream::StreamHandle;
use rmpv::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

type ConnectFuture = Pin<Box<dyn Future<Output = Result<StreamHandle, RpcError>> + Send>>;
type Connector = Arc<dyn Fn() -> ConnectFuture + Send + Sync>;

struct Inner {
    connection: Option<StreamHandle>,
    waiters: Vec<oneshot::Sender<Result<(), RpcError>>>,
    attempt: u32,
}

/// A connection handle that survives reconnects. Clone to share across
/// callers; all clones see the same underlying connection state.
#[derive(Clone)]
pub struct SingleConnectionHandler {
    inner: Arc<Mutex<Inner>>,
    stopped: Arc<AtomicBool>,
}

impl SingleConnectionHandler {
    /// `connector` is retried under `policy` until it succeeds or the
    /// retry budget is exhausted. The supervisor loop starts immediately
    /// in the background.
    pub fn spawn(connector: Connector, policy: ReconnectPolicy) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            connection: None,
            waiters: Vec::new(),
            attempt: 0,
        }));
        let stopped = Arc::new(AtomicBool::new(false));

        let handler = SingleConnectionHandler {
            inner: inner.clone(),
            stopped: stopped.clone(),
        };

        tokio::spawn(supervise(connector, policy, inner, stopped));

        handler
    }

    pub async fn create_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let connection = self.current_connection().await?;
        connection.create_request(method, params).await
    }

    pub async fn create_notification(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let connection = self.current_connection().await?;
        connection.create_notification(method, params).await
    }

    /// Returns the live connection, queuing on the same waiter set as
    /// [`wait_for_connection`](Self::wait_for_connection) while the
    /// supervisor is still retrying. Only fails once the handler is
    /// stopped or the retry budget is exhausted.
    async fn current_connection(&self) -> Result<StreamHandle, RpcError> {
        loop {
            self.wait_for_connection().await?;
            let guard = self.inner.lock().await;
            if let Some(conn) = &guard.connection {
                if conn.is_connected() {
                    return Ok(conn.clone());
                }
            }
            // Connection dropped again between the waiter firing and this
            // lock acquisition; loop back and wait for the next one.
        }
    }

    /// Suspends until a connection is live, or resolves with an error if
    /// the handler is stopped or the retry budget is already exhausted.
    pub async fn wait_for_connection(&self) -> Result<(), RpcError> {
        let rx = {
            let mut guard = self.inner.lock().await;
            if matches!(&guard.connection, Some(conn) if conn.is_connected()) {
                return Ok(());
            }
            if self.stopped.load(Ordering::Acquire) {
                return Err(RpcError::Connection("handler stopped".to_string()));
            }
            let (tx, rx) = oneshot::channel();
            guard.waiters.push(tx);
            rx
        };
        rx.await
            .map_err(|_| RpcError::Connection("handler stopped".to_string()))?
    }

    /// Stops retrying, closes any live connection, and fails every
    /// outstanding waiter. Idempotent.
    pub async fn disconnect(&self) {
        self.stopped.store(true, Ordering::Release);
        let mut guard = self.inner.lock().await;
        if let Some(conn) = guard.connection.take() {
            conn.disconnect().await;
        }
        for waiter in guard.waiters.drain(..) {
            let _ = waiter.send(Err(RpcError::Connection("disconnected".to_string())));
        }
    }
}

async fn supervise(
    connector: Connector,
    policy: ReconnectPolicy,
    inner: Arc<Mutex<Inner>>,
    stopped: Arc<AtomicBool>,
) {
    loop {
        if stopped.load(Ordering::Acquire) {
            return;
        }

        match connector().await {
            Ok(conn) => {
                let mut guard = inner.lock().await;
                guard.attempt = 0;
                guard.connection = Some(conn);
                for waiter in guard.waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                drop(guard);
                wait_for_disconnection(&inner).await;
            }
            Err(err) => {
                let attempt = {
                    let mut guard = inner.lock().await;
                    guard.attempt += 1;
                    guard.attempt
                };
                warn!(attempt, error = %err, "connect attempt failed");

                if policy.exhausted(attempt) {
                    let mut guard = inner.lock().await;
                    for waiter in guard.waiters.drain(..) {
                        let _ = waiter.send(Err(RpcError::Connection(
                            "max retries exhausted".to_string(),
                        )));
                    }
                    stopped.store(true, Ordering::Release);
                    return;
                }

                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
    }
}

const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Polls connection liveness until it drops, then clears it so the
/// supervisor loop reconnects. A push-based "closed" notification would
/// avoid the poll, but `StreamHandle` only exposes a liveness flag.
async fn wait_for_disconnection(inner: &Arc<Mutex<Inner>>) {
    loop {
        tokio::time::sleep(LIVENESS_POLL_INTERVAL).await;
        let mut guard = inner.lock().await;
        let still_live = matches!(&guard.connection, Some(conn) if conn.is_connected());
        if !still_live {
            debug!("connection lost, will reconnect");
            guard.connection = None;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn max_retries_zero_fails_first_waiter_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let connector: Connector = Arc::new(move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(RpcError::Connection("refused".to_string())) })
        });

        let handler = SingleConnectionHandler::spawn(
            connector,
            ReconnectPolicy::new().with_max_retries(Some(0)),
        );

        let result = handler.wait_for_connection().await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_fails_immediately_once_retries_are_exhausted() {
        let connector: Connector =
            Arc::new(|| Box::pin(async { Err(RpcError::Connection("refused".to_string())) }));
        let handler = SingleConnectionHandler::spawn(
            connector,
            ReconnectPolicy::new().with_max_retries(Some(0)),
        );

        let result = handler.create_request("echo", Value::from("hi")).await;
        assert!(matches!(result, Err(RpcError::Connection(_))));
    }

    #[tokio::test]
    async fn request_while_disconnected_but_retrying_queues_rather_than_failing_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let connector: Connector = Arc::new(move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(RpcError::Connection("refused".to_string())) })
        });
        let policy = ReconnectPolicy::new()
            .with_max_retries(Some(2))
            .with_max_delay(Duration::from_millis(50));
        let handler = SingleConnectionHandler::spawn(connector, policy);

        let started = std::time::Instant::now();
        let result = handler.create_request("echo", Value::from("hi")).await;
        assert!(matches!(result, Err(RpcError::Connection(_))));

        // With a two-attempt budget the handler queues through a backoff
        // delay rather than failing on the very first connect attempt.
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
