use crate::config::{Session, SortOrder};
use crate::models::Entity;
use crate::store::{EntityStore, MutationLayer};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// A render-ready entity with pending intents applied
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewItem {
    pub entity: Entity,
    /// Authored by the session user (edit/delete affordances)
    pub is_own: bool,
    /// Unconfirmed create, toggle or edit
    pub is_pending: bool,
    pub is_edited: bool,
    pub has_flag: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewNode {
    pub item: ViewItem,
    pub children: Vec<ViewNode>,
    /// The reply thread has its own live subscription and pagination
    pub expanded: bool,
    /// Older replies can be loaded for this node
    pub has_more_replies: bool,
}

impl ViewNode {
    pub fn id(&self) -> &str {
        &self.item.entity.id
    }

    /// Depth-first walk including this node
    pub fn walk(&self) -> Vec<&ViewNode> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

/// Inputs shared by both projections
pub struct Projection<'a> {
    pub store: &'a EntityStore,
    pub overlay: &'a MutationLayer,
    pub session: &'a Session,
    pub order: SortOrder,
}

impl<'a> Projection<'a> {
    /// Visible entities in display order. Tombstones and pending deletes are skipped.
    pub fn list(&self) -> Vec<ViewItem> {
        let mut visible = self.visible();
        sort_entities(&mut visible, self.order);
        visible.into_iter().map(|e| self.item(e)).collect()
    }

    /// Comment tree under `root_id` (the post). `expansion` reports, per
    /// comment id, whether its reply thread is open and whether it has more pages.
    ///
    /// A comment whose parent is not visible is not rendered at all; it never
    /// falls back to the top level.
    pub fn tree<F>(&self, root_id: &str, expansion: F) -> Vec<ViewNode>
    where
        F: Fn(&str) -> Option<bool>,
    {
        let mut top_level = Vec::new();
        let mut children: HashMap<&str, Vec<&Entity>> = HashMap::new();
        for entity in self.visible() {
            match entity.parent_id.as_deref() {
                None => top_level.push(entity),
                Some(parent) if parent == root_id => top_level.push(entity),
                Some(parent) => children.entry(parent).or_default().push(entity),
            }
        }
        for siblings in children.values_mut() {
            sort_entities(siblings, self.order);
        }
        sort_entities(&mut top_level, self.order);

        top_level
            .into_iter()
            .map(|e| self.node(e, &children, &expansion))
            .collect()
    }

    fn node<F>(
        &self,
        entity: &Entity,
        children: &HashMap<&str, Vec<&Entity>>,
        expansion: &F,
    ) -> ViewNode
    where
        F: Fn(&str) -> Option<bool>,
    {
        let state = expansion(entity.id.as_str());
        ViewNode {
            item: self.item(entity),
            children: children
                .get(entity.id.as_str())
                .map(|kids| {
                    kids.iter()
                        .map(|kid| self.node(kid, children, expansion))
                        .collect()
                })
                .unwrap_or_default(),
            expanded: state.is_some(),
            has_more_replies: state.unwrap_or(false),
        }
    }

    fn visible(&self) -> Vec<&'a Entity> {
        self.store
            .records()
            .filter(|r| r.is_visible())
            .map(|r| &r.entity)
            .collect()
    }

    fn item(&self, entity: &Entity) -> ViewItem {
        let shown = self.overlay.overlay(entity);
        ViewItem {
            is_own: shown.payload.author_id.as_deref() == Some(self.session.user_id.as_str()),
            is_pending: entity.pending || self.overlay.has_pending(&entity.id),
            is_edited: shown.payload.edited_at.is_some(),
            has_flag: shown.flag_count() > 0 || shown.is_flagged_by_me(),
            entity: shown,
        }
    }
}

/// Total order on (sequence key, id); reversed for descending collections.
pub fn compare(a: &Entity, b: &Entity) -> Ordering {
    a.sequence_key
        .cmp(&b.sequence_key)
        .then_with(|| a.id.cmp(&b.id))
}

fn sort_entities(entities: &mut [&Entity], order: SortOrder) {
    match order {
        SortOrder::Ascending => entities.sort_by(|a, b| compare(a, b)),
        SortOrder::Descending => entities.sort_by(|a, b| compare(b, a)),
    }
}
