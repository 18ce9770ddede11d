//! Fan-out of mutation events to a user's other sessions.
//!
//! One event is serialized once and pushed onto every live channel in the
//! user's bucket except the channel that caused the mutation; that session
//! already holds the result from its own request.
//!
//! Delivery is best effort per channel. A closed or failing channel is
//! skipped, evicted from the registry, and never stops delivery to the
//! rest. Sends only enqueue, so publishing never waits on a socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::ConnectionId;
use crate::protocol::{MutationKind, ServerEvent};
use crate::record::{Record, UserId};
use crate::registry::ConnectionRegistry;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_published: u64,
    pub deliveries: u64,
    pub skipped_closed: u64,
    pub send_failures: u64,
}

/// Atomic broadcast stats, lock-free on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    events_published: AtomicU64,
    deliveries: AtomicU64,
    skipped_closed: AtomicU64,
    send_failures: AtomicU64,
}

/// Publishes events to the channels held in a [`ConnectionRegistry`].
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    stats: AtomicBroadcastStats,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Sends `event` to every live channel of `user` except `origin`.
    ///
    /// Returns the number of channels the frame was handed to. A user with
    /// no live sessions is a silent no-op.
    pub fn publish(&self, user: UserId, event: &ServerEvent, origin: Option<&ConnectionId>) -> usize {
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);

        let channels = self.registry.channels_for(user);
        if channels.is_empty() {
            log::trace!("No live sessions for user {user}, dropping {} event", event.kind());
            return 0;
        }

        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode {} event for user {user}: {e}", event.kind());
                return 0;
            }
        };

        let mut delivered = 0;
        for channel in channels {
            if origin == Some(channel.connection_id()) {
                continue;
            }

            if !channel.is_live() {
                self.stats.skipped_closed.fetch_add(1, Ordering::Relaxed);
                channel.mark_closed();
                self.registry.evict(&channel);
                log::debug!("Skipped closed channel {}", channel.connection_id());
                continue;
            }

            match channel.send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    channel.mark_closed();
                    self.registry.evict(&channel);
                    log::warn!("Dropping channel {} after failed send: {e}", channel.connection_id());
                }
            }
        }

        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        log::debug!(
            "Published {} for user {user} to {delivered} channel(s)",
            event.kind()
        );
        delivered
    }

    /// Publishes the post-mutation state of `record` to the owner's other
    /// sessions.
    pub fn publish_mutation(
        &self,
        kind: MutationKind,
        record: &Record,
        origin: Option<&ConnectionId>,
    ) -> usize {
        self.publish(record.user_id, &kind.event(record.clone()), origin)
    }

    /// Get broadcast statistics (lock-free snapshot).
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            skipped_closed: self.stats.skipped_closed.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
        }
    }
}
