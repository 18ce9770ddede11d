//! Persistence collaborator for records.
//!
//! The sync core never writes records itself; it hands proposed changes to
//! a [`RecordStore`], which must run the version gate and the version
//! increment as one atomic step per record and return the post-write state.
//!
//! [`MemoryStore`] is the in-process implementation:
//!
//! ```text
//! DashMap<RecordId, Arc<Mutex<Slot>>>
//!          │              │
//!          │              └── per-record lock: gate + increment + write
//!          └── shard lock: held only long enough to clone the Arc
//! ```
//!
//! Mutations on different records never wait on each other's record lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::record::{ListQuery, NewRecord, Page, Record, RecordId, RecordPatch, UserId};
use crate::version;

/// Durable home of records, as seen by the record service.
///
/// Records owned by a different user are reported as `NotFound`.
pub trait RecordStore: Send + Sync {
    /// Stores a validated new record with `version = 1`.
    fn insert(&self, user: UserId, fields: NewRecord) -> SyncResult<Record>;

    fn get(&self, user: UserId, id: RecordId) -> SyncResult<Record>;

    fn list(&self, user: UserId, query: &ListQuery) -> SyncResult<Page>;

    /// Gates `client_version` against the stored version and, if accepted,
    /// validates `patch`, applies it and bumps the version by one.
    ///
    /// Errors surface in order: `NotFound`, `VersionConflict`, `Validation`.
    fn apply_update(
        &self,
        user: UserId,
        id: RecordId,
        patch: &RecordPatch,
        client_version: Option<i64>,
    ) -> SyncResult<Record>;

    /// Gates `client_version` and removes the record, returning its final
    /// state.
    fn remove(&self, user: UserId, id: RecordId, client_version: Option<i64>) -> SyncResult<Record>;

    /// Newest `updated_at` among the user's records, or now if none.
    fn last_updated(&self, user: UserId) -> SystemTime;
}

struct Slot {
    record: Record,
    /// Set under the slot lock when the record is deleted, so a writer that
    /// cloned the Arc before removal cannot resurrect it.
    removed: bool,
}

/// In-memory record store.
pub struct MemoryStore {
    records: DashMap<RecordId, Arc<Mutex<Slot>>>,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of stored records across all users.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn slot(&self, id: RecordId) -> SyncResult<Arc<Mutex<Slot>>> {
        self.records
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SyncError::NotFound(id))
    }

    /// Clones every slot handle so no shard lock is held while a record lock
    /// is taken. `remove` takes the two in the opposite order.
    fn snapshot_slots(&self) -> Vec<Arc<Mutex<Slot>>> {
        self.records
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl RecordStore for MemoryStore {
    fn insert(&self, user: UserId, fields: NewRecord) -> SyncResult<Record> {
        fields.validate()?;
        let id = RecordId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = SystemTime::now();
        let record = Record {
            id,
            user_id: user,
            text: fields.text.unwrap_or_default(),
            completed: fields.completed.unwrap_or(false),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.records.insert(
            id,
            Arc::new(Mutex::new(Slot {
                record: record.clone(),
                removed: false,
            })),
        );
        Ok(record)
    }

    fn get(&self, user: UserId, id: RecordId) -> SyncResult<Record> {
        let slot = self.slot(id)?;
        let slot = slot.lock();
        if slot.removed || slot.record.user_id != user {
            return Err(SyncError::NotFound(id));
        }
        Ok(slot.record.clone())
    }

    fn list(&self, user: UserId, query: &ListQuery) -> SyncResult<Page> {
        query.validate()?;
        let matching = self
            .snapshot_slots()
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                let visible = !slot.removed && slot.record.user_id == user;
                (visible && query.matches(&slot.record)).then(|| slot.record.clone())
            })
            .collect();
        Ok(query.paginate(matching))
    }

    fn apply_update(
        &self,
        user: UserId,
        id: RecordId,
        patch: &RecordPatch,
        client_version: Option<i64>,
    ) -> SyncResult<Record> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock();
        if slot.removed || slot.record.user_id != user {
            return Err(SyncError::NotFound(id));
        }

        version::ensure(client_version, slot.record.version)?;
        patch.validate()?;

        patch.apply_to(&mut slot.record);
        slot.record.version = version::next_version(slot.record.version);
        slot.record.updated_at = SystemTime::now();
        Ok(slot.record.clone())
    }

    fn remove(&self, user: UserId, id: RecordId, client_version: Option<i64>) -> SyncResult<Record> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock();
        if guard.removed || guard.record.user_id != user {
            return Err(SyncError::NotFound(id));
        }

        version::ensure(client_version, guard.record.version)?;

        guard.removed = true;
        self.records.remove(&id);
        Ok(guard.record.clone())
    }

    fn last_updated(&self, user: UserId) -> SystemTime {
        self.snapshot_slots()
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                (!slot.removed && slot.record.user_id == user).then_some(slot.record.updated_at)
            })
            .max()
            .unwrap_or_else(SystemTime::now)
    }
}
