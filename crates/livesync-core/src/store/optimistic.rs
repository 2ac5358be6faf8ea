//! Optimistic mutation overlay.
//!
//! Speculative values live here, never in the entity store: the store only
//! ever holds server-confirmed data (plus optimistic creates, which carry the
//! `pending` marker). The projection overlays these slots on top of the
//! store, so a late or rejected response can always be resolved against the
//! confirmed value underneath.

use crate::backend::ToggleOp;
use crate::models::Entity;
use std::collections::{BTreeMap, HashMap};

/// A toggleable per-viewer attribute of an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attribute {
    Reaction(String),
    Flag,
}

impl Attribute {
    pub fn reaction(name: impl Into<String>) -> Self {
        Attribute::Reaction(name.into())
    }

    /// Confirmed value as carried by the entity
    pub fn read(&self, entity: &Entity) -> bool {
        match self {
            Attribute::Reaction(r) => entity.has_reaction(r),
            Attribute::Flag => entity.is_flagged_by_me(),
        }
    }

    /// Write a value into the entity, adjusting the matching count
    pub fn write(&self, entity: &mut Entity, present: bool) -> bool {
        match self {
            Attribute::Reaction(r) => entity.set_reaction(r, present),
            Attribute::Flag => entity.set_flag(present),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleState {
    ConfirmedAbsent,
    ConfirmedPresent,
    PendingAdd,
    PendingRemove,
}

impl ToggleState {
    /// What the user currently sees
    pub fn is_present(&self) -> bool {
        matches!(self, ToggleState::ConfirmedPresent | ToggleState::PendingAdd)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ToggleState::PendingAdd | ToggleState::PendingRemove)
    }
}

pub type RequestId = u64;

#[derive(Debug, Clone, Default)]
struct ToggleSlot {
    /// Intent of the latest in-flight request
    pending: Option<bool>,
    /// Last issued request
    latest: RequestId,
    /// Newest request whose acknowledgement was folded into the store
    settled: RequestId,
}

/// Issued by `toggle`; hand back to `acknowledge` or `reject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleTicket {
    pub entity_id: String,
    pub attribute: Attribute,
    pub request: RequestId,
    pub op: ToggleOp,
}

/// How a toggle response must be reflected in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Latest intent confirmed; write the value, the pending state is gone
    Confirmed(bool),
    /// A superseded request landed; write the value as the new confirmed
    /// baseline, the newer intent keeps overlaying it
    Baseline(bool),
    /// Latest request failed; the overlay is dropped and the confirmed value shows again
    RolledBack,
    /// Late response for a request already superseded by a settled one
    Ignored,
}

#[derive(Debug, Clone)]
struct EditSlot {
    latest: RequestId,
    text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditTicket {
    pub entity_id: String,
    pub request: RequestId,
    pub text: String,
}

#[derive(Default)]
pub struct MutationLayer {
    toggles: HashMap<String, BTreeMap<Attribute, ToggleSlot>>,
    edits: HashMap<String, EditSlot>,
}

impl MutationLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.toggles.clear();
        self.edits.clear();
    }

    // ===== Toggles =====

    pub fn state(&self, entity: &Entity, attribute: &Attribute) -> ToggleState {
        let pending = self
            .toggles
            .get(&entity.id)
            .and_then(|slots| slots.get(attribute))
            .and_then(|slot| slot.pending);
        match pending {
            Some(true) => ToggleState::PendingAdd,
            Some(false) => ToggleState::PendingRemove,
            None if attribute.read(entity) => ToggleState::ConfirmedPresent,
            None => ToggleState::ConfirmedAbsent,
        }
    }

    /// Flip what the user sees and issue a new request for that intent.
    pub fn toggle(&mut self, entity: &Entity, attribute: Attribute) -> ToggleTicket {
        let desired = !self.state(entity, &attribute).is_present();
        let slot = self
            .toggles
            .entry(entity.id.clone())
            .or_default()
            .entry(attribute.clone())
            .or_default();
        slot.latest += 1;
        slot.pending = Some(desired);

        ToggleTicket {
            entity_id: entity.id.clone(),
            attribute,
            request: slot.latest,
            op: ToggleOp::from_present(desired),
        }
    }

    pub fn acknowledge(&mut self, ticket: &ToggleTicket) -> Resolution {
        let Some(slot) = self.slot_mut(ticket) else {
            return Resolution::Ignored;
        };
        if ticket.request <= slot.settled {
            return Resolution::Ignored;
        }
        slot.settled = ticket.request;

        let value = ticket.op.is_add();
        if ticket.request == slot.latest {
            slot.pending = None;
            Resolution::Confirmed(value)
        } else {
            Resolution::Baseline(value)
        }
    }

    pub fn reject(&mut self, ticket: &ToggleTicket) -> Resolution {
        let Some(slot) = self.slot_mut(ticket) else {
            return Resolution::Ignored;
        };
        if ticket.request == slot.latest && slot.pending.is_some() {
            slot.pending = None;
            Resolution::RolledBack
        } else {
            Resolution::Ignored
        }
    }

    fn slot_mut(&mut self, ticket: &ToggleTicket) -> Option<&mut ToggleSlot> {
        self.toggles
            .get_mut(&ticket.entity_id)?
            .get_mut(&ticket.attribute)
    }

    // ===== Edits =====

    pub fn begin_edit(&mut self, entity_id: &str, text: impl Into<String>) -> EditTicket {
        let text = text.into();
        let slot = self
            .edits
            .entry(entity_id.to_string())
            .or_insert(EditSlot {
                latest: 0,
                text: None,
            });
        slot.latest += 1;
        slot.text = Some(text.clone());

        EditTicket {
            entity_id: entity_id.to_string(),
            request: slot.latest,
            text,
        }
    }

    /// Drop the overlay if `ticket` is still the newest edit. Returns whether it was.
    pub fn finish_edit(&mut self, ticket: &EditTicket) -> bool {
        match self.edits.get_mut(&ticket.entity_id) {
            Some(slot) if slot.latest == ticket.request => {
                slot.text = None;
                true
            }
            _ => false,
        }
    }

    pub fn pending_text(&self, entity_id: &str) -> Option<&str> {
        self.edits.get(entity_id)?.text.as_deref()
    }

    // ===== Overlay =====

    pub fn has_pending(&self, entity_id: &str) -> bool {
        self.pending_text(entity_id).is_some()
            || self
                .toggles
                .get(entity_id)
                .is_some_and(|slots| slots.values().any(|s| s.pending.is_some()))
    }

    /// The entity as the user should see it, with every pending intent applied.
    pub fn overlay(&self, entity: &Entity) -> Entity {
        let mut shown = entity.clone();
        if let Some(slots) = self.toggles.get(&entity.id) {
            for (attribute, slot) in slots {
                if let Some(desired) = slot.pending {
                    attribute.write(&mut shown, desired);
                }
            }
        }
        if let Some(text) = self.pending_text(&entity.id) {
            shown.payload.text = Some(text.to_string());
        }
        shown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;

    fn like() -> Attribute {
        Attribute::reaction("like")
    }

    fn make_comment() -> Entity {
        Entity::new("c1", EntityKind::Comment, 1)
    }

    #[test]
    fn test_toggle_transitions() {
        let mut layer = MutationLayer::new();
        let mut entity = make_comment();
        assert_eq!(layer.state(&entity, &like()), ToggleState::ConfirmedAbsent);

        let add = layer.toggle(&entity, like());
        assert_eq!(add.op, ToggleOp::Add);
        assert_eq!(layer.state(&entity, &like()), ToggleState::PendingAdd);

        let remove = layer.toggle(&entity, like());
        assert_eq!(remove.op, ToggleOp::Remove);
        assert_eq!(layer.state(&entity, &like()), ToggleState::PendingRemove);

        assert_eq!(layer.acknowledge(&remove), Resolution::Confirmed(false));
        assert_eq!(layer.state(&entity, &like()), ToggleState::ConfirmedAbsent);

        entity.set_reaction("like", true);
        assert_eq!(layer.state(&entity, &like()), ToggleState::ConfirmedPresent);
        let remove = layer.toggle(&entity, like());
        assert_eq!(remove.op, ToggleOp::Remove);
    }

    #[test]
    fn test_latest_intent_wins_with_out_of_order_acks() {
        let mut layer = MutationLayer::new();
        let mut entity = make_comment();

        let req1 = layer.toggle(&entity, like());
        let req2 = layer.toggle(&entity, like());
        let req3 = layer.toggle(&entity, like());
        assert_eq!(
            (req1.request, req2.request, req3.request),
            (1, 2, 3)
        );

        assert_eq!(layer.acknowledge(&req2), Resolution::Baseline(false));
        assert_eq!(layer.state(&entity, &like()), ToggleState::PendingAdd);

        match layer.acknowledge(&req3) {
            Resolution::Confirmed(value) => {
                like().write(&mut entity, value);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(layer.acknowledge(&req1), Resolution::Ignored);
        assert_eq!(layer.state(&entity, &like()), ToggleState::ConfirmedPresent);
    }

    #[test]
    fn test_reject_latest_rolls_back() {
        let mut layer = MutationLayer::new();
        let entity = make_comment();
        let ticket = layer.toggle(&entity, like());

        assert_eq!(layer.reject(&ticket), Resolution::RolledBack);
        assert_eq!(layer.state(&entity, &like()), ToggleState::ConfirmedAbsent);
        assert_eq!(layer.overlay(&entity).reaction_count("like"), 0);
    }

    #[test]
    fn test_reject_superseded_is_ignored() {
        let mut layer = MutationLayer::new();
        let entity = make_comment();
        let first = layer.toggle(&entity, like());
        let _second = layer.toggle(&entity, like());

        assert_eq!(layer.reject(&first), Resolution::Ignored);
        assert_eq!(layer.state(&entity, &like()), ToggleState::PendingRemove);
    }

    #[test]
    fn test_overlay_applies_counts_and_text() {
        let mut layer = MutationLayer::new();
        let mut entity = make_comment().with_text("original");
        entity.payload.reaction_counts = Some([("like".to_string(), 2)].into_iter().collect());

        layer.toggle(&entity, like());
        layer.toggle(&entity, Attribute::Flag);
        layer.begin_edit("c1", "edited");

        let shown = layer.overlay(&entity);
        assert_eq!(shown.reaction_count("like"), 3);
        assert!(shown.has_reaction("like"));
        assert!(shown.is_flagged_by_me());
        assert_eq!(shown.text(), "edited");
        assert_eq!(entity.reaction_count("like"), 2);
        assert!(layer.has_pending("c1"));
    }

    #[test]
    fn test_only_latest_edit_clears_overlay() {
        let mut layer = MutationLayer::new();
        let first = layer.begin_edit("c1", "one");
        let second = layer.begin_edit("c1", "two");

        assert!(!layer.finish_edit(&first));
        assert_eq!(layer.pending_text("c1"), Some("two"));
        assert!(layer.finish_edit(&second));
        assert_eq!(layer.pending_text("c1"), None);
        assert!(!layer.has_pending("c1"));
    }
}
