//! WebSocket sync server with per-user session fanout.
//!
//! Architecture:
//! ```text
//! Tab A ──┐                         ┌──► ConnectionRegistry
//!         ├── connection task ──────┤        user 7 ─► {A, B}
//! Tab B ──┘   (auth handshake)      │
//!                                   │
//! RecordService ── store (gate + increment) ── Broadcaster ──► every
//!                                                   session of user 7
//!                                                   except the origin
//! ```
//!
//! Each connection is one task that owns its socket. It reads inbound
//! frames one at a time and drains a bounded outbound queue that the
//! broadcaster fills without ever awaiting the network.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{ChannelSession, CredentialVerifier, Handshake, HmacTokenVerifier};
use crate::broadcast::{BroadcastStats, Broadcaster};
use crate::channel::{Outbound, WsSink};
use crate::config::ServerConfig;
use crate::error::SyncResult;
use crate::registry::ConnectionRegistry;
use crate::service::RecordService;
use crate::store::{MemoryStore, RecordStore};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// WebSocket upgrades completed since start
    pub accepted_connections: u64,
    /// Sockets currently open, authenticated or not
    pub active_connections: u64,
    /// Channels currently in the registry
    pub authenticated_channels: usize,
    /// Users with at least one authenticated channel
    pub connected_users: usize,
    pub failed_handshakes: u64,
    pub broadcast: BroadcastStats,
}

#[derive(Default)]
struct SocketCounters {
    accepted: AtomicU64,
    active: AtomicU64,
}

/// The sync server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    handshake: Arc<Handshake>,
    service: RecordService,
    counters: Arc<SocketCounters>,
}

impl SyncServer {
    /// Create a server with an HMAC verifier keyed from `config` and an
    /// in-memory record store.
    pub fn new(config: ServerConfig) -> Self {
        let verifier = HmacTokenVerifier::new(config.token_secret.clone())
            .with_expiry(config.token_expiry);
        Self::with_parts(config, Arc::new(verifier), Arc::new(MemoryStore::new()))
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with caller-supplied collaborators.
    pub fn with_parts(
        config: ServerConfig,
        verifier: Arc<dyn CredentialVerifier>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));
        let handshake = Handshake::new(verifier, Arc::clone(&registry))
            .with_connection_limit(config.max_connections_per_user);
        let service = RecordService::new(store, Arc::clone(&broadcaster));

        Self {
            config: Arc::new(config),
            registry,
            broadcaster,
            handshake: Arc::new(handshake),
            service,
            counters: Arc::new(SocketCounters::default()),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> SyncResult<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> SyncResult<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from upgrade to teardown.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> SyncResult<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);

        let (sink, outbound) = WsSink::new(self.config.outbound_capacity);
        let sink = Arc::new(sink);
        let mut session = ChannelSession::new(sink.clone());
        let result = self
            .drive(ws_stream, &sink, outbound, &mut session, addr)
            .await;

        // Deregister before the socket is considered gone.
        self.handshake.close(&mut session);
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn drive(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        sink: &WsSink,
        mut outbound: mpsc::Receiver<Outbound>,
        session: &mut ChannelSession,
        addr: SocketAddr,
    ) -> SyncResult<()> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let deadline = self.config.auth_timeout.map(|t| Instant::now() + t);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handshake.handle_frame(session, text.as_str());
                        }
                        Some(Ok(Message::Binary(data))) => {
                            log::warn!("Ignoring {}-byte binary frame from {addr}", data.len());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                // Outgoing frames queued by the handshake or the broadcaster
                out = outbound.recv() => {
                    match out {
                        Some(Outbound::Text(frame)) => {
                            ws_sender.send(Message::Text(frame.to_string().into())).await?;
                        }
                        Some(Outbound::Close) | None => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            log::debug!("Closing connection from {addr}");
                            break;
                        }
                    }
                }

                // The reader stopped draining and the queue filled up
                _ = sink.aborted() => {
                    log::warn!("Dropping stalled connection from {addr}");
                    break;
                }

                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                }, if session.is_pending() => {
                    log::info!("Connection from {addr} did not authenticate in time");
                    self.handshake.expire(session);
                }
            }
        }

        Ok(())
    }

    /// Number of authenticated channels across all users.
    pub fn total_connections(&self) -> usize {
        self.registry.total_connections()
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            accepted_connections: self.counters.accepted.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            authenticated_channels: self.registry.total_connections(),
            connected_users: self.registry.user_count(),
            failed_handshakes: self.handshake.failed_handshakes(),
            broadcast: self.broadcaster.stats(),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Record operations whose mutations fan out to this server's channels.
    pub fn records(&self) -> &RecordService {
        &self.service
    }
}
