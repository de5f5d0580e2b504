//! Handle to a live client session.
//!
//! The transport owns the socket; everything else talks to a connection through this
//! handle, which queues outbound frames for the connection's writer task.

use crate::error::{RelayError, Result};
use crate::protocol::ServerFrame;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Frames a connection may have queued before it counts as stalled.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Items drained by a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(ServerFrame),
    /// Close the socket and stop writing.
    Close,
}

pub struct Connection {
    id: ConnectionId,
    connected_at: DateTime<Utc>,
    open: AtomicBool,
    closed: CancellationToken,
    /// User id of the last token this connection subscribed with.
    identity: Mutex<Option<String>>,
    tx: mpsc::Sender<Outbound>,
}

impl Connection {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
            identity: Mutex::new(None),
            tx,
        }
    }

    /// Create a connection together with the receiving end of its outbound queue.
    pub fn channel() -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        Self::with_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(tx)), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn identity(&self) -> Option<String> {
        self.identity.lock().clone()
    }

    pub fn set_identity(&self, user_id: &str) {
        *self.identity.lock() = Some(user_id.to_string());
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queue a frame for this connection.
    ///
    /// Fails with [`RelayError::Socket`] once the connection is closed or its writer is
    /// gone. A full queue means the client stopped reading: the connection is closed and
    /// its task runs disconnect cleanup.
    pub fn send(&self, frame: ServerFrame) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(RelayError::Socket(format!("connection {} is closed", self.id)));
        }
        match self.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full on connection {}, closing it", self.id);
                self.close();
                Err(RelayError::Socket(format!(
                    "connection {} is not reading its frames",
                    self.id
                )))
            }
            Err(TrySendError::Closed(_)) => {
                self.mark_closed();
                Err(RelayError::Socket(format!(
                    "connection {} writer has stopped",
                    self.id
                )))
            }
        }
    }

    /// Ask the writer task to close the socket and wake the connection's task.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            // Dropped when the queue is full; the connection's task still sees `closed`.
            let _ = self.tx.try_send(Outbound::Close);
        }
        self.closed.cancel();
    }

    /// Mark closed without notifying the writer (the socket is already gone).
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
        self.closed.cancel();
    }

    /// Resolves once the connection has been closed from any side.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity())
            .field("open", &self.is_open())
            .finish()
    }
}
