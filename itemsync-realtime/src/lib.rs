//! # itemsync-realtime: real-time multi-session sync for owned records
//!
//! Keeps every open session of a user informed about changes that user
//! makes to their items from any other session, and refuses writes made
//! against a stale copy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per tab)   │     JSON frames     │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ auth handshake
//!                                     ┌──────┴────────────┐
//!                                     │ConnectionRegistry │
//!                                     │ user → channels   │
//!                                     └──────┬────────────┘
//!                                            │
//! ┌─────────────┐   ┌─────────────┐   ┌──────┴──────┐
//! │RecordService│──►│ RecordStore │──►│ Broadcaster │──► other sessions
//! │ (validate)  │   │ (gate + v+1)│   │ (skip origin)│    of the owner
//! └─────────────┘   └─────────────┘   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`version`]: optimistic-concurrency gate
//! - [`auth`]: token verification and the per-channel handshake
//! - [`registry`]: per-user map of authenticated channels
//! - [`broadcast`]: fanout with self-echo suppression
//! - [`service`]: validate → persist → publish pipeline
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod auth;
pub mod broadcast;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod server;
pub mod service;
pub mod store;
pub mod version;

// Re-exports for convenience
pub use auth::{ChannelSession, CredentialVerifier, Handshake, HmacTokenVerifier, SessionState};
pub use broadcast::{BroadcastStats, Broadcaster};
pub use channel::{ChannelHandle, ConnectionId, Outbound, Sendable, WsSink};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::ServerConfig;
pub use error::{SyncError, SyncResult};
pub use protocol::{ClientMessage, MutationKind, ServerEvent};
pub use record::{ListQuery, NewRecord, Page, Record, RecordId, RecordPatch, UserId};
pub use registry::ConnectionRegistry;
pub use server::{ServerStats, SyncServer};
pub use service::RecordService;
pub use store::{MemoryStore, RecordStore};
pub use version::VersionCheck;
