//! Stable per-connection identity.
//!
//! Pub/Sub peer identity must be a handle that outlives any single
//! request, not a transport address — a UNIX stream subscriber and a
//! reconnected TCP subscriber both need per-connection dispatch for
//! publication delivery. Grounded in the teacher's
//! `next_connection_id: Arc<AtomicU64>` counter in `src/ipc/tcp_socket.rs`.

use std::sync::atomic::{AtomicU64, Ordering};

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}
