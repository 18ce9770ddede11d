//! Error taxonomy for the synchronization subsystem.
//!
//! None of these errors is fatal to the process. Channel-scoped failures
//! (bad credentials, malformed frames) are reported back over the same
//! channel; mutation failures are surfaced to the caller of the record
//! service and never produce a broadcast.

use thiserror::Error;

use crate::record::{RecordId, UserId};

/// Result alias used across the crate.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Bearer credential failed signature, expiry or format checks.
    #[error("Invalid or expired token: {0}")]
    InvalidCredential(String),

    /// The client edited a stale copy of the record.
    #[error("Version conflict: client version ({client}) is older than server version ({server})")]
    VersionConflict { client: u64, server: u64 },

    #[error("Item with id {0} not found")]
    NotFound(RecordId),

    /// One or more field validation messages, joined by ", ".
    #[error("{0}")]
    Validation(String),

    /// A send on a channel failed. Logged and skipped by the broadcaster.
    #[error("Channel send failed: {0}")]
    ChannelSend(String),

    /// Inbound frame could not be handled (bad JSON, duplicate auth, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("User {user} already has {limit} live connections")]
    ConnectionLimit { user: UserId, limit: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl SyncError {
    /// HTTP status an outer REST surface would map this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidCredential(_) => 401,
            Self::VersionConflict { .. } => 409,
            Self::NotFound(_) => 404,
            Self::Validation(_) | Self::Protocol(_) => 400,
            Self::ConnectionLimit { .. } => 429,
            Self::ChannelSend(_) | Self::Config(_) | Self::Io(_) | Self::WebSocket(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// A conflicting write may be retried once the client has re-read the
    /// record.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::ConnectionLimit { .. })
    }
}
