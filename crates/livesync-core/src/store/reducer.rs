use crate::backend::RealtimeEvent;
use crate::error::SyncError;
use crate::models::{Entity, EntityKind};
use crate::store::EntityStore;
use tracing::{trace, warn};

/// Outcome of applying one realtime event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// Re-delivery or stale update; the store is untouched
    Unchanged,
    Rejected(SyncError),
}

impl Applied {
    pub fn changed(&self) -> bool {
        matches!(self, Applied::Changed)
    }
}

/// Apply a pushed event to the store in arrival order.
///
/// Display order comes from the sequence key, so out-of-order arrival is
/// harmless. `Lost` carries no data and is handled by the subscription pump.
pub fn apply_event(store: &mut EntityStore, kind: EntityKind, event: RealtimeEvent) -> Applied {
    match event {
        RealtimeEvent::Upsert(entity) => {
            if let Err(error) = validate(&entity, kind) {
                warn!(id = %entity.id, "rejected realtime upsert: {}", error);
                return Applied::Rejected(error);
            }
            // Pushed values are authoritative
            let entity = Entity {
                pending: false,
                ..entity
            };
            if store.upsert(entity) {
                Applied::Changed
            } else {
                Applied::Unchanged
            }
        }
        RealtimeEvent::Remove { id } => {
            if id.is_empty() {
                return Applied::Rejected(SyncError::validation("removal without id"));
            }
            if store.tombstone(&id, kind) {
                Applied::Changed
            } else {
                Applied::Unchanged
            }
        }
        RealtimeEvent::Lost { reason } => {
            trace!(%reason, "lost signal reached reducer");
            Applied::Unchanged
        }
    }
}

/// Page results go through the same checks as pushed entities.
pub fn apply_page(store: &mut EntityStore, kind: EntityKind, entities: Vec<Entity>) -> usize {
    let mut changed = 0;
    for entity in entities {
        if apply_event(store, kind, RealtimeEvent::Upsert(entity)).changed() {
            changed += 1;
        }
    }
    changed
}

fn validate(entity: &Entity, kind: EntityKind) -> Result<(), SyncError> {
    if entity.id.is_empty() {
        return Err(SyncError::validation("entity without id"));
    }
    if entity.kind != kind {
        return Err(SyncError::validation(format!(
            "expected {} entity, got {}",
            kind, entity.kind
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SequenceKey;

    fn upsert(id: &str, seq: u64) -> RealtimeEvent {
        RealtimeEvent::Upsert(Entity::new(id, EntityKind::Message, seq).with_text(id))
    }

    #[test]
    fn test_redelivery_is_noop() {
        let mut store = EntityStore::new();
        assert_eq!(
            apply_event(&mut store, EntityKind::Message, upsert("m1", 1)),
            Applied::Changed
        );
        let snapshot = store.snapshot();
        assert_eq!(
            apply_event(&mut store, EntityKind::Message, upsert("m1", 1)),
            Applied::Unchanged
        );
        assert_eq!(store.snapshot(), snapshot);
    }

    #[test]
    fn test_out_of_order_arrival_keeps_newest() {
        let mut store = EntityStore::new();
        apply_event(&mut store, EntityKind::Message, upsert("m1", 5));
        assert_eq!(
            apply_event(&mut store, EntityKind::Message, upsert("m1", 3)),
            Applied::Unchanged
        );
        assert_eq!(store.get("m1").unwrap().sequence_key, SequenceKey(5));
    }

    #[test]
    fn test_pushed_pending_marker_is_dropped() {
        let mut store = EntityStore::new();
        let event = Entity::new("m1", EntityKind::Message, 1).as_pending();
        apply_event(&mut store, EntityKind::Message, RealtimeEvent::Upsert(event));
        assert!(!store.get("m1").unwrap().pending);
    }

    #[test]
    fn test_rejects_invalid_entities() {
        let mut store = EntityStore::new();
        let applied = apply_event(&mut store, EntityKind::Message, upsert("", 1));
        assert!(matches!(applied, Applied::Rejected(SyncError::Validation { .. })));

        let comment = Entity::new("c1", EntityKind::Comment, 1);
        let applied = apply_event(
            &mut store,
            EntityKind::Message,
            RealtimeEvent::Upsert(comment),
        );
        assert!(matches!(applied, Applied::Rejected(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_keeps_tombstone() {
        let mut store = EntityStore::new();
        apply_event(&mut store, EntityKind::Message, upsert("m1", 1));
        let applied = apply_event(
            &mut store,
            EntityKind::Message,
            RealtimeEvent::Remove {
                id: "m1".to_string(),
            },
        );
        assert_eq!(applied, Applied::Changed);
        assert!(store.get("m1").unwrap().is_deleted());
    }

    #[test]
    fn test_apply_page_counts_changes() {
        let mut store = EntityStore::new();
        apply_event(&mut store, EntityKind::Message, upsert("m1", 1));
        let page = vec![
            Entity::new("m1", EntityKind::Message, 1).with_text("m1"),
            Entity::new("m2", EntityKind::Message, 2).with_text("m2"),
        ];
        assert_eq!(apply_page(&mut store, EntityKind::Message, page), 1);
        assert_eq!(store.len(), 2);
    }
}
