//! Channels: one live connection from a client session.
//!
//! The broadcaster never touches a socket. It talks to a [`Sendable`], a
//! fire-and-forget capability that enqueues a frame and returns at once.
//! [`WsSink`] is the WebSocket implementation: frames go onto a bounded
//! queue drained by the connection task that owns the socket. A reader
//! that stops draining fills the queue; the next send fails and the sink
//! aborts, so the broadcaster evicts the channel and the task drops the
//! socket.
//!
//! ```text
//! Broadcaster ──send()──► WsSink ──mpsc──► connection task ──► WebSocket
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::record::{now_millis, UserId};

/// Process-unique identifier minted when a channel authenticates.
///
/// Shape: `{user}-{unix_millis}-{nonce}` so ids stay distinct across
/// restarts as well as within one process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn mint(user: UserId) -> Self {
        Self(format!("{}-{}-{}", user, now_millis(), Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport capability used for outbound delivery.
///
/// `send` must not block on network I/O. Errors are best-effort signals;
/// the caller logs them and moves on.
pub trait Sendable: Send + Sync {
    fn send(&self, frame: Arc<str>) -> SyncResult<()>;

    fn is_open(&self) -> bool;

    /// Requests the underlying connection be closed. Frames queued before
    /// the call are still flushed.
    fn close(&self);
}

/// Work item for the task that owns a WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    Close,
}

/// Queue depth used when a caller has no configured capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// [`Sendable`] backed by the outbound queue of a WebSocket task.
pub struct WsSink {
    tx: mpsc::Sender<Outbound>,
    open: AtomicBool,
    aborted: Notify,
}

impl WsSink {
    /// Returns the sink and the receiver the connection task drains.
    /// At most `capacity` frames wait in the queue.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx,
            open: AtomicBool::new(true),
            aborted: Notify::new(),
        };
        (sink, rx)
    }

    /// Resolves once the sink gave up on the connection without being able
    /// to queue [`Outbound::Close`]. Queued frames should be dropped.
    pub async fn aborted(&self) {
        self.aborted.notified().await
    }

    fn abort(&self) {
        self.open.store(false, Ordering::Release);
        self.aborted.notify_one();
    }
}

impl Sendable for WsSink {
    fn send(&self, frame: Arc<str>) -> SyncResult<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(SyncError::ChannelSend("channel closed".into()));
        }
        match self.tx.try_send(Outbound::Text(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.abort();
                Err(SyncError::ChannelSend(format!(
                    "outbound queue full ({} frames)",
                    self.tx.max_capacity()
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SyncError::ChannelSend("connection task gone".into()))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel)
            && matches!(self.tx.try_send(Outbound::Close), Err(mpsc::error::TrySendError::Full(_)))
        {
            self.aborted.notify_one();
        }
    }
}

/// An authenticated channel as stored in the registry.
///
/// Immutable apart from the liveness flag, which flips once at close.
pub struct ChannelHandle {
    connection_id: ConnectionId,
    user_id: UserId,
    authenticated_at: SystemTime,
    sink: Arc<dyn Sendable>,
    closed: AtomicBool,
}

impl ChannelHandle {
    pub fn new(user_id: UserId, connection_id: ConnectionId, sink: Arc<dyn Sendable>) -> Self {
        Self {
            connection_id,
            user_id,
            authenticated_at: SystemTime::now(),
            sink,
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn authenticated_at(&self) -> SystemTime {
        self.authenticated_at
    }

    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.sink.is_open()
    }

    /// Flips the liveness flag. Returns true only for the first caller.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn send(&self, frame: Arc<str>) -> SyncResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::ChannelSend(format!(
                "channel {} already closed",
                self.connection_id
            )));
        }
        self.sink.send(frame)
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("live", &self.is_live())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[test]
    fn test_connection_id_shape() {
        let id = ConnectionId::mint(UserId(17));
        let parts: Vec<&str> = id.as_str().splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "17");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 32);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::mint(UserId(1));
        let b = ConnectionId::mint(UserId(1));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_ws_sink_queues_then_closes() {
        let (sink, mut rx) = WsSink::new(8);
        sink.send(Arc::from("hello")).unwrap();
        sink.close();
        assert!(!sink.is_open());
        assert!(sink.send(Arc::from("late")).is_err());

        assert_eq!(rx.recv().await, Some(Outbound::Text(Arc::from("hello"))));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
    }

    #[test]
    fn test_ws_sink_reports_closed_when_task_is_gone() {
        let (sink, rx) = WsSink::new(8);
        drop(rx);
        assert!(!sink.is_open());
        assert!(sink.send(Arc::from("x")).is_err());
    }

    #[tokio::test]
    async fn test_ws_sink_full_queue_aborts() {
        let (sink, mut rx) = WsSink::new(2);
        sink.send(Arc::from("a")).unwrap();
        sink.send(Arc::from("b")).unwrap();

        let err = sink.send(Arc::from("c")).unwrap_err();
        assert!(matches!(err, SyncError::ChannelSend(_)));
        assert!(!sink.is_open());
        assert!(sink.send(Arc::from("d")).is_err());

        // The connection task is woken even though Close could not be queued.
        tokio::time::timeout(std::time::Duration::from_secs(1), sink.aborted())
            .await
            .expect("abort should be signalled");
        assert_eq!(rx.recv().await, Some(Outbound::Text(Arc::from("a"))));
        assert_eq!(rx.recv().await, Some(Outbound::Text(Arc::from("b"))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ws_sink_close_on_full_queue_aborts() {
        let (sink, _rx) = WsSink::new(1);
        sink.send(Arc::from("a")).unwrap();
        sink.close();
        assert!(!sink.is_open());
        tokio::time::timeout(std::time::Duration::from_secs(1), sink.aborted())
            .await
            .expect("abort should be signalled");
    }

    #[test]
    fn test_handle_mark_closed_once() {
        let sink = RecordingSink::new();
        let handle = ChannelHandle::new(UserId(1), ConnectionId::new("c1"), sink.clone());
        assert!(handle.is_live());
        assert!(handle.mark_closed());
        assert!(!handle.mark_closed());
        assert!(!handle.is_live());
        assert!(handle.send(Arc::from("x")).is_err());
        assert_eq!(sink.sent(), 0);
    }
}
