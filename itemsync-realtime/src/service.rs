//! Record mutations with broadcast-after-commit.
//!
//! Every write goes validate → store (gate + increment) → publish. Updates
//! are validated by the store after the gate, so a missing or stale record
//! is reported before a bad patch. The event
//! carries the record exactly as the store returned it, and nothing is
//! published unless the store accepted the write.

use std::sync::Arc;
use std::time::SystemTime;

use crate::broadcast::Broadcaster;
use crate::channel::ConnectionId;
use crate::error::SyncResult;
use crate::protocol::MutationKind;
use crate::record::{ListQuery, NewRecord, Page, Record, RecordId, RecordPatch, UserId};
use crate::store::RecordStore;

/// Front door for record reads and writes.
///
/// `origin` on the write paths is the connection id the requesting session
/// received at authentication; that session is skipped during fanout.
#[derive(Clone)]
pub struct RecordService {
    store: Arc<dyn RecordStore>,
    broadcaster: Arc<Broadcaster>,
}

impl RecordService {
    pub fn new(store: Arc<dyn RecordStore>, broadcaster: Arc<Broadcaster>) -> Self {
        Self { store, broadcaster }
    }

    pub fn create(
        &self,
        user: UserId,
        fields: NewRecord,
        origin: Option<&ConnectionId>,
    ) -> SyncResult<Record> {
        fields.validate()?;
        let record = self.store.insert(user, fields)?;
        log::debug!("Created record {} for user {user}", record.id);
        self.broadcaster
            .publish_mutation(MutationKind::Created, &record, origin);
        Ok(record)
    }

    pub fn update(
        &self,
        user: UserId,
        id: RecordId,
        patch: RecordPatch,
        client_version: Option<i64>,
        origin: Option<&ConnectionId>,
    ) -> SyncResult<Record> {
        let record = self
            .store
            .apply_update(user, id, &patch, client_version)
            .inspect_err(|e| log::debug!("Update of record {id} rejected: {e}"))?;
        log::debug!("Updated record {id} to version {}", record.version);
        self.broadcaster
            .publish_mutation(MutationKind::Updated, &record, origin);
        Ok(record)
    }

    pub fn delete(
        &self,
        user: UserId,
        id: RecordId,
        client_version: Option<i64>,
        origin: Option<&ConnectionId>,
    ) -> SyncResult<Record> {
        let record = self
            .store
            .remove(user, id, client_version)
            .inspect_err(|e| log::debug!("Delete of record {id} rejected: {e}"))?;
        log::debug!("Deleted record {id} at version {}", record.version);
        self.broadcaster
            .publish_mutation(MutationKind::Deleted, &record, origin);
        Ok(record)
    }

    pub fn get(&self, user: UserId, id: RecordId) -> SyncResult<Record> {
        self.store.get(user, id)
    }

    pub fn list(&self, user: UserId, query: &ListQuery) -> SyncResult<Page> {
        query.validate()?;
        self.store.list(user, query)
    }

    pub fn last_updated(&self, user: UserId) -> SystemTime {
        self.store.last_updated(user)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::RecordingSink;
    use crate::error::SyncError;
    use crate::protocol::ServerEvent;
    use crate::registry::ConnectionRegistry;
    use crate::store::MemoryStore;

    const U: UserId = UserId(1);

    fn setup() -> (Arc<ConnectionRegistry>, RecordService) {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));
        let service = RecordService::new(Arc::new(MemoryStore::new()), broadcaster);
        (registry, service)
    }

    /// Brings a record to `version` through ordinary updates.
    fn record_at(service: &RecordService, version: u64) -> Record {
        let mut record = service.create(U, NewRecord::new("draft"), None).unwrap();
        while record.version < version {
            record = service
                .update(U, record.id, RecordPatch::completed(false), None, None)
                .unwrap();
        }
        record
    }

    #[test]
    fn test_two_session_scenario() {
        let (registry, service) = setup();
        let r = record_at(&service, 3);

        let sink_a = RecordingSink::new();
        let sink_b = RecordingSink::new();
        let a1 = ConnectionId::new("A1");
        let b1 = ConnectionId::new("B1");
        registry.register(U, a1.clone(), sink_a.clone());
        registry.register(U, b1.clone(), sink_b.clone());

        let updated = service
            .update(U, r.id, RecordPatch::text("renamed"), Some(3), Some(&a1))
            .unwrap();
        assert_eq!(updated.version, 4);

        assert_eq!(sink_a.sent(), 0);
        match &sink_b.events()[..] {
            [ServerEvent::Updated { record }] => {
                assert_eq!(record.id, updated.id);
                assert_eq!(record.version, 4);
                assert_eq!(record.text, "renamed");
            }
            other => panic!("expected one updated event, got {other:?}"),
        }

        let stale = service.update(U, r.id, RecordPatch::completed(true), Some(3), Some(&b1));
        assert!(matches!(
            stale,
            Err(SyncError::VersionConflict { client: 3, server: 4 })
        ));
        assert_eq!(service.get(U, r.id).unwrap().version, 4);
        assert_eq!(sink_a.sent(), 0);
        assert_eq!(sink_b.sent(), 1);
    }

    #[test]
    fn test_create_and_delete_fan_out() {
        let (registry, service) = setup();
        let watcher = RecordingSink::new();
        registry.register(U, ConnectionId::new("w"), watcher.clone());

        let created = service.create(U, NewRecord::new("buy milk"), None).unwrap();
        let deleted = service.delete(U, created.id, Some(1), None).unwrap();

        let kinds: Vec<_> = watcher.events().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, ["created", "deleted"]);
        assert_eq!(deleted.id, created.id);
        assert!(matches!(service.get(U, created.id), Err(SyncError::NotFound(_))));
    }

    #[test]
    fn test_validation_failure_writes_and_publishes_nothing() {
        let (registry, service) = setup();
        let watcher = RecordingSink::new();
        registry.register(U, ConnectionId::new("w"), watcher.clone());

        assert!(matches!(
            service.create(U, NewRecord::new("  "), None),
            Err(SyncError::Validation(_))
        ));
        assert_eq!(service.list(U, &ListQuery::default()).unwrap().total, 0);

        let r = service.create(U, NewRecord::new("valid"), None).unwrap();
        let err = service
            .update(U, r.id, RecordPatch::default(), Some(1), None)
            .unwrap_err();
        assert_eq!(err.to_string(), "Nothing to update");
        assert_eq!(service.get(U, r.id).unwrap().version, 1);
        assert_eq!(watcher.sent(), 1);
    }

    #[test]
    fn test_update_error_precedence_with_invalid_patch() {
        let (registry, service) = setup();
        let watcher = RecordingSink::new();
        registry.register(U, ConnectionId::new("w"), watcher.clone());
        let r = record_at(&service, 3);
        let sent_before = watcher.sent();

        assert!(matches!(
            service.update(U, RecordId(999), RecordPatch::text(""), Some(3), None),
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            service.update(U, r.id, RecordPatch::text(""), Some(2), None),
            Err(SyncError::VersionConflict { client: 2, server: 3 })
        ));
        assert!(matches!(
            service.update(U, r.id, RecordPatch::text(""), Some(3), None),
            Err(SyncError::Validation(_))
        ));

        assert_eq!(service.get(U, r.id).unwrap().version, 3);
        assert_eq!(watcher.sent(), sent_before);
    }

    #[test]
    fn test_errors_do_not_broadcast() {
        let (registry, service) = setup();
        let watcher = RecordingSink::new();
        registry.register(U, ConnectionId::new("w"), watcher.clone());
        let r = record_at(&service, 2);
        let before = watcher.sent();

        assert!(service.update(U, RecordId(999), RecordPatch::completed(true), None, None).is_err());
        assert!(service.delete(U, r.id, Some(1), None).is_err());
        assert!(service.update(UserId(2), r.id, RecordPatch::completed(true), None, None).is_err());

        assert_eq!(watcher.sent(), before);
    }

    #[test]
    fn test_other_users_sessions_never_see_events() {
        let (registry, service) = setup();
        let stranger = RecordingSink::new();
        registry.register(UserId(2), ConnectionId::new("s"), stranger.clone());

        record_at(&service, 3);
        assert_eq!(stranger.sent(), 0);
    }

    #[test]
    fn test_list_rejects_bad_query() {
        let (_, service) = setup();
        let query = ListQuery {
            limit: 0,
            ..ListQuery::default()
        };
        assert!(matches!(service.list(U, &query), Err(SyncError::Validation(_))));
    }
}
