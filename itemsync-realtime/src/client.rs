//! WebSocket client for a sync server session.
//!
//! Provides:
//! - Connection lifecycle (connect, authenticate, close)
//! - Decoded server events on a single ordered channel
//!
//! Events are delivered in the order the server sent them. Mutation events
//! can arrive right behind the authentication ack, so an application
//! should keep reading the same receiver instead of waiting for the ack on
//! a separate path.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::channel::ConnectionId;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ServerEvent};
use crate::record::{Record, UserId};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, no credential accepted yet
    Connected,
    Authenticated,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// The server accepted our credential
    Authenticated {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    /// Another session of ours created a record
    Created(Record),
    /// Another session of ours updated a record
    Updated(Record),
    /// Another session of ours deleted a record
    Deleted(Record),
    /// The server reported an error on this channel
    Error(String),
    /// Connection lost
    Disconnected,
}

impl From<ServerEvent> for SyncEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::Authenticated {
                user_id,
                connection_id,
            } => Self::Authenticated {
                user_id,
                connection_id,
            },
            ServerEvent::Error { message } => Self::Error(message),
            ServerEvent::Created { record } => Self::Created(record),
            ServerEvent::Updated { record } => Self::Updated(record),
            ServerEvent::Deleted { record } => Self::Deleted(record),
        }
    }
}

#[derive(Debug, Clone)]
struct SessionIdentity {
    user_id: UserId,
    connection_id: ConnectionId,
}

/// The sync client.
pub struct SyncClient {
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Set once the server acknowledges authentication
    identity: Arc<RwLock<Option<SessionIdentity>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            identity: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> SyncResult<()> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: decode server events in arrival order
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let identity = self.identity.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if let ServerEvent::Authenticated {
                                user_id,
                                connection_id,
                            } = &event
                            {
                                *identity.write().await = Some(SessionIdentity {
                                    user_id: *user_id,
                                    connection_id: connection_id.clone(),
                                });
                                *state.write().await = ConnectionState::Authenticated;
                            }
                            let _ = event_tx.send(event.into()).await;
                        }
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send the bearer token. The outcome arrives as an
    /// [`SyncEvent::Authenticated`] or [`SyncEvent::Error`] event.
    pub async fn authenticate(&self, token: &str) -> SyncResult<()> {
        let frame = ClientMessage::auth(token).encode()?;
        self.send(Message::Text(frame.into())).await
    }

    /// Send a raw text frame. Used to exercise how the server treats
    /// unrecognized messages.
    pub async fn send_text(&self, text: impl Into<String>) -> SyncResult<()> {
        let text: String = text.into();
        self.send(Message::Text(text.into())).await
    }

    /// Ask the server to close the connection.
    pub async fn close(&self) -> SyncResult<()> {
        self.send(Message::Close(None)).await
    }

    async fn send(&self, msg: Message) -> SyncResult<()> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or_else(|| SyncError::Protocol("not connected".into()))?;
        tx.send(msg)
            .await
            .map_err(|_| SyncError::ChannelSend("connection closed".into()))
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// User the server bound this session to, once authenticated.
    pub async fn user_id(&self) -> Option<UserId> {
        self.identity.read().await.as_ref().map(|i| i.user_id)
    }

    /// Connection id to pass as the origin of this session's own writes.
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        self.identity
            .read()
            .await
            .as_ref()
            .map(|i| i.connection_id.clone())
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
