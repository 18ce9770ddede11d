//! Optimistic-concurrency version gate.
//!
//! Every record carries a `version` counter starting at 1. A client sends
//! the version it last observed along with a mutation; the gate compares it
//! to the stored version:
//!
//! ```text
//! client absent / <= 0     → accept (client has no opinion)
//! client <  server         → reject (edit based on a stale read)
//! client >= server         → accept
//! ```
//!
//! Only staleness is rejected. A client that is *ahead* of the stored value
//! (rapid double submits from one session) is accepted. On acceptance the
//! persistence layer stores `next_version(server)`; rejected writes leave
//! the stored version untouched.

use crate::error::{SyncError, SyncResult};

/// Outcome of a version comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    pub conflict: bool,
    /// Human-readable explanation, present only when `conflict` is set.
    pub reason: Option<String>,
}

impl VersionCheck {
    fn accepted() -> Self {
        Self {
            conflict: false,
            reason: None,
        }
    }
}

/// Narrows a raw wire value to a usable version. Zero and negative numbers
/// are treated the same as an absent value.
fn positive(value: Option<i64>) -> Option<u64> {
    value.filter(|v| *v > 0).map(|v| v as u64)
}

/// Compares the client's last observed version against the stored one.
pub fn check(client_version: Option<i64>, server_version: Option<i64>) -> VersionCheck {
    let (Some(client), Some(server)) = (positive(client_version), positive(server_version)) else {
        return VersionCheck::accepted();
    };

    if client < server {
        VersionCheck {
            conflict: true,
            reason: Some(SyncError::VersionConflict { client, server }.to_string()),
        }
    } else {
        VersionCheck::accepted()
    }
}

/// Same rule as [`check`], shaped for `?` propagation inside mutation paths.
pub fn ensure(client_version: Option<i64>, server_version: u64) -> SyncResult<()> {
    match positive(client_version) {
        Some(client) if client < server_version => Err(SyncError::VersionConflict {
            client,
            server: server_version,
        }),
        _ => Ok(()),
    }
}

/// Version to store after an accepted write.
pub fn next_version(server_version: u64) -> u64 {
    server_version.saturating_add(1)
}
