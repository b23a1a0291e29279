//! A live gateway connection as the hub sees it.
//!
//! The hub owns the only [`Connection`] (and with it the only queue sender);
//! the transport keeps the matching [`OutboundQueue`]. Dropping the
//! `Connection` closes the queue, which ends the transport's write loop.

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use realm_common::ConnectionId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// An encoded text frame. Clones share one buffer, so a publish encodes once
/// and every recipient's queue holds the same bytes.
pub type Payload = Utf8Bytes;

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// The queue is at capacity; the reader has fallen behind.
    Full,
    /// The transport side has gone away.
    Closed,
}

pub struct Connection {
    id: ConnectionId,
    user_id: String,
    connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Payload>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// New connection with a fresh id and a queue of `capacity` frames.
    pub fn new(user_id: impl Into<String>, capacity: usize) -> (Self, OutboundQueue) {
        Self::with_id(ConnectionId::new(), user_id, capacity)
    }

    pub fn with_id(id: ConnectionId, user_id: impl Into<String>, capacity: usize) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id,
            user_id: user_id.into(),
            connected_at: Utc::now(),
            tx,
        };
        (conn, OutboundQueue { rx })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Enqueue without waiting.
    pub fn send(&self, payload: Payload) -> SendOutcome {
        match self.tx.try_send(payload) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => SendOutcome::Full,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }
}

/// Receiving half of a connection's outbound queue, held by the writer task.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Payload>,
}

impl OutboundQueue {
    /// Next frame to write, or `None` once the hub has let go of the connection.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Non-blocking variant, used by tests to inspect what was delivered.
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }

    /// True once the sender is gone and every queued frame has been read.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed() && self.rx.is_empty()
    }
}
