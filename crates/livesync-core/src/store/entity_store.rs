use crate::models::{Entity, EntityKind, Payload, SequenceKey};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::watch;
use tracing::trace;

/// Store entry: the latest known entity plus local-only bookkeeping.
#[derive(Debug, Clone)]
pub struct Record {
    pub entity: Entity,
    /// Hidden from the projection while a delete request is in flight
    pub pending_delete: bool,
    /// Store revision of the last write to this record
    revision: u64,
}

impl Record {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_visible(&self) -> bool {
        !self.pending_delete && !self.entity.is_deleted()
    }
}

/// Single source of truth for one collection: id -> latest entity.
///
/// Both pagination and the realtime reducer write through `upsert`, so an id
/// can never appear twice. Writes that leave the content unchanged do not
/// bump the revision and do not notify.
pub struct EntityStore {
    records: HashMap<String, Record>,
    revision: u64,
    changes: watch::Sender<u64>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            records: HashMap::new(),
            revision: 0,
            changes,
        }
    }

    // ===== Getters =====

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.records.get(id).map(|r| &r.entity)
    }

    pub fn record(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get_all(&self) -> Vec<&Entity> {
        self.records.values().map(|r| &r.entity).collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Receiver that observes the revision after every change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn max_sequence_key(&self) -> SequenceKey {
        self.records
            .values()
            .map(|r| r.entity.sequence_key)
            .max()
            .unwrap_or_default()
    }

    /// Content view without revision stamps, for comparing stores.
    pub fn snapshot(&self) -> BTreeMap<String, (Entity, bool)> {
        self.records
            .iter()
            .map(|(id, r)| (id.clone(), (r.entity.clone(), r.pending_delete)))
            .collect()
    }

    // ===== Mutations =====

    /// Insert or merge `incoming` by id. Returns whether the store changed.
    pub fn upsert(&mut self, incoming: Entity) -> bool {
        let Some(existing) = self.records.get(&incoming.id) else {
            let id = incoming.id.clone();
            let revision = self.bump();
            self.records.insert(
                id,
                Record {
                    entity: incoming,
                    pending_delete: false,
                    revision,
                },
            );
            return true;
        };

        let Some(next) = merge(&existing.entity, incoming) else {
            trace!(id = %existing.entity.id, "ignored stale or optimistic write");
            return false;
        };
        if next == existing.entity {
            return false;
        }

        let revision = self.bump();
        if let Some(record) = self.records.get_mut(&next.id) {
            record.entity = next;
            record.revision = revision;
        }
        true
    }

    /// Apply an in-place change to an existing entity. `f` returns whether it changed anything.
    pub fn update(&mut self, id: &str, f: impl FnOnce(&mut Entity) -> bool) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if !f(&mut record.entity) {
            return false;
        }
        self.revision += 1;
        record.revision = self.revision;
        self.changes.send_replace(self.revision);
        true
    }

    /// Physically drop an entry. Only for rolling back an optimistic create
    /// that never existed server-side.
    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        let record = self.records.remove(id)?;
        self.bump();
        Some(record.entity)
    }

    pub fn mark_pending_delete(&mut self, id: &str) -> bool {
        self.set_pending_delete(id, true)
    }

    pub fn clear_pending_delete(&mut self, id: &str) -> bool {
        self.set_pending_delete(id, false)
    }

    /// Turn `id` into a confirmed soft-delete tombstone. Unknown ids get a
    /// stub so that a page arriving later cannot resurrect the entity.
    pub fn tombstone(&mut self, id: &str, kind: EntityKind) -> bool {
        if !self.records.contains_key(id) {
            let stub = Entity::new(id, kind, 0).with_payload(Payload {
                is_deleted: Some(true),
                ..Default::default()
            });
            return self.upsert(stub);
        }

        let revision = self.revision + 1;
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.entity.is_deleted() && !record.pending_delete && !record.entity.pending {
            return false;
        }
        record.entity.payload.is_deleted = Some(true);
        record.entity.pending = false;
        record.pending_delete = false;
        record.revision = revision;
        self.bump();
        true
    }

    /// Drop confirmed records of a page window last written at or before
    /// `revision`. Optimistic entries, pending deletes, tombstones, entities
    /// outside the window and anything written afterwards survive.
    pub fn retain_since(&mut self, revision: u64, in_window: impl Fn(&Entity) -> bool) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| {
            r.entity.pending
                || r.pending_delete
                || r.entity.is_deleted()
                || r.revision > revision
                || !in_window(&r.entity)
        });
        let removed = before - self.records.len();
        if removed > 0 {
            self.bump();
        }
        removed
    }

    /// Empty the store (collection closed). Subscribers stay attached.
    pub fn clear(&mut self) {
        if !self.records.is_empty() {
            self.records.clear();
            self.bump();
        }
    }

    /// Signal a change that lives outside the records (optimistic overlay)
    /// so that projections get recomputed.
    pub fn notify(&mut self) -> u64 {
        self.bump()
    }

    fn set_pending_delete(&mut self, id: &str, value: bool) -> bool {
        let revision = self.revision + 1;
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.pending_delete == value {
            return false;
        }
        record.pending_delete = value;
        record.revision = revision;
        self.bump();
        true
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.changes.send_replace(self.revision);
        self.revision
    }
}

/// Merge rule: confirmed beats pending, authoritative replaces optimistic,
/// and between confirmed values a lower sequence key is stale.
/// Returns None when `incoming` must be ignored.
fn merge(existing: &Entity, incoming: Entity) -> Option<Entity> {
    match (existing.pending, incoming.pending) {
        (false, true) => None,
        (true, _) => Some(incoming),
        (false, false) => {
            if incoming.sequence_key < existing.sequence_key {
                return None;
            }
            let mut next = existing.clone();
            next.kind = incoming.kind;
            next.sequence_key = incoming.sequence_key;
            if incoming.parent_id.is_some() {
                next.parent_id = incoming.parent_id;
            }
            next.payload.merge(incoming.payload);
            Some(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message(id: &str, seq: u64, text: &str) -> Entity {
        Entity::new(id, EntityKind::Message, seq).with_text(text)
    }

    #[test]
    fn test_upsert_inserts_and_merges() {
        let mut store = EntityStore::new();
        assert!(store.upsert(make_message("m1", 1, "hello").with_author("alice")));

        let mut update = Entity::new("m1", EntityKind::Message, 1);
        update.payload.text = Some("edited".to_string());
        assert!(store.upsert(update));

        let merged = store.get("m1").unwrap();
        assert_eq!(merged.text(), "edited");
        assert_eq!(merged.payload.author_id.as_deref(), Some("alice"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_twice_is_idempotent() {
        let mut store = EntityStore::new();
        let event = make_message("m1", 4, "hi");
        store.upsert(event.clone());
        let snapshot = store.snapshot();
        let revision = store.revision();

        assert!(!store.upsert(event));
        assert_eq!(store.snapshot(), snapshot);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn test_confirmed_never_regresses_to_lower_sequence() {
        let mut store = EntityStore::new();
        store.upsert(make_message("m1", 5, "newer"));

        assert!(!store.upsert(make_message("m1", 3, "older")));
        let entity = store.get("m1").unwrap();
        assert_eq!(entity.sequence_key, SequenceKey(5));
        assert_eq!(entity.text(), "newer");
    }

    #[test]
    fn test_pending_never_overwrites_confirmed() {
        let mut store = EntityStore::new();
        store.upsert(make_message("m1", 2, "server"));

        assert!(!store.upsert(make_message("m1", 9, "local").as_pending()));
        assert_eq!(store.get("m1").unwrap().text(), "server");
    }

    #[test]
    fn test_confirmed_replaces_pending() {
        let mut store = EntityStore::new();
        store.upsert(make_message("m1", 9, "local").as_pending());

        assert!(store.upsert(make_message("m1", 7, "server")));
        let entity = store.get("m1").unwrap();
        assert!(!entity.pending);
        assert_eq!(entity.sequence_key, SequenceKey(7));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_disjoint_writes_commute() {
        let page = vec![make_message("a", 1, "a"), make_message("b", 2, "b")];
        let event = make_message("c", 3, "c");

        let mut first = EntityStore::new();
        for e in page.clone() {
            first.upsert(e);
        }
        first.upsert(event.clone());

        let mut second = EntityStore::new();
        second.upsert(event);
        for e in page {
            second.upsert(e);
        }

        assert_eq!(first.snapshot(), second.snapshot());
    }

    #[test]
    fn test_tombstone_stub_blocks_resurrection() {
        let mut store = EntityStore::new();
        assert!(store.tombstone("m1", EntityKind::Message));
        store.upsert(make_message("m1", 3, "late page"));

        let entity = store.get("m1").unwrap();
        assert!(entity.is_deleted());
        assert_eq!(entity.text(), "late page");
        assert!(!store.record("m1").unwrap().is_visible());
    }

    #[test]
    fn test_pending_delete_flag() {
        let mut store = EntityStore::new();
        store.upsert(make_message("m1", 1, "x"));
        assert!(store.mark_pending_delete("m1"));
        assert!(!store.mark_pending_delete("m1"));
        assert!(!store.record("m1").unwrap().is_visible());
        assert!(store.clear_pending_delete("m1"));
        assert!(store.record("m1").unwrap().is_visible());
        assert!(!store.mark_pending_delete("missing"));
    }

    #[test]
    fn test_retain_since_keeps_racing_writes_and_pending() {
        let mut store = EntityStore::new();
        store.upsert(make_message("old", 1, "old"));
        store.upsert(make_message("reply", 1, "reply").with_parent("old"));
        store.upsert(make_message("local", 2, "local").as_pending());
        store.upsert(make_message("gone", 2, "gone"));
        store.tombstone("gone", EntityKind::Message);
        store.upsert(make_message("deleting", 2, "deleting"));
        store.mark_pending_delete("deleting");
        let mark = store.revision();
        store.upsert(make_message("live", 3, "live"));

        assert_eq!(store.retain_since(mark, |e| e.parent_id.is_none()), 1);
        assert!(!store.contains("old"));
        assert!(store.contains("reply"));
        assert!(store.contains("local"));
        assert!(store.contains("gone"));
        assert!(store.contains("live"));
        assert!(store.record("deleting").unwrap().pending_delete);
    }

    #[test]
    fn test_clear_notifies() {
        let mut store = EntityStore::new();
        let rx = store.subscribe();
        store.upsert(make_message("m1", 1, "x"));
        store.clear();
        assert!(store.is_empty());
        assert_eq!(*rx.borrow(), 2);
        store.clear();
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn test_change_notification() {
        let mut store = EntityStore::new();
        let rx = store.subscribe();
        store.upsert(make_message("m1", 1, "x"));
        assert_eq!(*rx.borrow(), store.revision());
        assert!(store.remove("m1").is_some());
        assert_eq!(*rx.borrow(), store.revision());
        assert!(store.remove("m1").is_none());
    }
}
