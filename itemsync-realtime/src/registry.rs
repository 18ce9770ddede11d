//! Per-user registry of authenticated channels.
//!
//! ```text
//! DashMap<UserId, Bucket>
//!    user 7 ─► { "7-…-a1" → ChannelHandle, "7-…-b4" → ChannelHandle }
//!    user 9 ─► { "9-…-c2" → ChannelHandle }
//! ```
//!
//! Each bucket is only touched through its DashMap entry, so register,
//! deregister (with pruning) and snapshot reads are linearizable per user.
//! No user ever maps to an empty bucket. Nothing here performs I/O while an
//! entry is held; the broadcaster works from a cloned snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::channel::{ChannelHandle, ConnectionId, Sendable};
use crate::error::{SyncError, SyncResult};
use crate::record::UserId;

type Bucket = HashMap<ConnectionId, Arc<ChannelHandle>>;

/// Process-wide map from user to that user's live channels.
#[derive(Default)]
pub struct ConnectionRegistry {
    buckets: DashMap<UserId, Bucket>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a channel, creating the user's bucket if needed. A duplicate
    /// connection id overwrites the previous entry.
    pub fn register(
        &self,
        user: UserId,
        connection_id: ConnectionId,
        sink: Arc<dyn Sendable>,
    ) -> Arc<ChannelHandle> {
        let handle = Arc::new(ChannelHandle::new(user, connection_id.clone(), sink));
        self.buckets
            .entry(user)
            .or_default()
            .insert(connection_id, Arc::clone(&handle));
        handle
    }

    /// Like [`register`](Self::register) but refuses to grow a bucket past
    /// `limit` live channels. The check and the insert happen under the
    /// same entry lock.
    pub fn try_register(
        &self,
        user: UserId,
        connection_id: ConnectionId,
        sink: Arc<dyn Sendable>,
        limit: Option<usize>,
    ) -> SyncResult<Arc<ChannelHandle>> {
        let mut bucket = self.buckets.entry(user).or_default();
        if let Some(limit) = limit {
            if !bucket.contains_key(&connection_id) && bucket.len() >= limit {
                let empty = bucket.is_empty();
                drop(bucket);
                if empty {
                    self.prune(user);
                }
                return Err(SyncError::ConnectionLimit { user, limit });
            }
        }
        let handle = Arc::new(ChannelHandle::new(user, connection_id.clone(), sink));
        bucket.insert(connection_id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Removes a channel and prunes the bucket if it became empty.
    pub fn deregister(&self, user: UserId, connection_id: &ConnectionId) -> Option<Arc<ChannelHandle>> {
        match self.buckets.entry(user) {
            Entry::Occupied(mut bucket) => {
                let removed = bucket.get_mut().remove(connection_id);
                if bucket.get().is_empty() {
                    bucket.remove();
                }
                removed
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Removes `channel` only if it is still the entry registered under its
    /// id. Used for cleanup of stale handles found during a broadcast, where
    /// the id may already have been re-registered.
    pub fn evict(&self, channel: &Arc<ChannelHandle>) -> bool {
        match self.buckets.entry(channel.user_id()) {
            Entry::Occupied(mut bucket) => {
                let id = channel.connection_id();
                let same = bucket
                    .get()
                    .get(id)
                    .is_some_and(|current| Arc::ptr_eq(current, channel));
                if same {
                    bucket.get_mut().remove(id);
                }
                if bucket.get().is_empty() {
                    bucket.remove();
                }
                same
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Snapshot of the user's channels at call time. Empty if the user has
    /// no bucket.
    pub fn channels_for(&self, user: UserId) -> Vec<Arc<ChannelHandle>> {
        self.buckets
            .get(&user)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, user: UserId, connection_id: &ConnectionId) -> Option<Arc<ChannelHandle>> {
        self.buckets
            .get(&user)
            .and_then(|bucket| bucket.get(connection_id).cloned())
    }

    /// Sum of all bucket sizes.
    pub fn total_connections(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn connection_count(&self, user: UserId) -> usize {
        self.buckets.get(&user).map_or(0, |bucket| bucket.len())
    }

    /// Number of users with at least one live channel.
    pub fn user_count(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the user currently has a bucket.
    pub fn contains_user(&self, user: UserId) -> bool {
        self.buckets.contains_key(&user)
    }

    fn prune(&self, user: UserId) {
        self.buckets.remove_if(&user, |_, bucket| bucket.is_empty());
    }
}
