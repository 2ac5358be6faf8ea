use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Message,
    Comment,
    Post,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Message => "message",
            EntityKind::Comment => "comment",
            EntityKind::Post => "post",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server ordering value (channel segment for messages, creation time in ms otherwise).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceKey(pub u64);

impl SequenceKey {
    pub fn next(self) -> Self {
        SequenceKey(self.0.saturating_add(1))
    }
}

/// Domain content of an entity.
///
/// Every field is optional: realtime updates frequently carry only the
/// fields that changed (e.g. reaction counts), and a merge only overwrites
/// the fields the incoming value actually carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    /// Reaction type -> total count across all actors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_counts: Option<BTreeMap<String, u64>>,
    /// Reaction types the viewing user has applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_reactions: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flagged_by_me: Option<bool>,
}

impl Payload {
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Field-wise merge: fields present in `incoming` win, absent ones keep
    /// the current value. A confirmed soft delete is terminal.
    pub fn merge(&mut self, incoming: Payload) {
        let Payload {
            text,
            author_id,
            created_at,
            edited_at,
            reaction_counts,
            my_reactions,
            is_deleted,
            flag_count,
            flagged_by_me,
        } = incoming;

        if text.is_some() {
            self.text = text;
        }
        if author_id.is_some() {
            self.author_id = author_id;
        }
        if created_at.is_some() {
            self.created_at = created_at;
        }
        if edited_at.is_some() {
            self.edited_at = edited_at;
        }
        if reaction_counts.is_some() {
            self.reaction_counts = reaction_counts;
        }
        if my_reactions.is_some() {
            self.my_reactions = my_reactions;
        }
        if self.is_deleted != Some(true) && is_deleted.is_some() {
            self.is_deleted = is_deleted;
        }
        if flag_count.is_some() {
            self.flag_count = flag_count;
        }
        if flagged_by_me.is_some() {
            self.flagged_by_me = flagged_by_me;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    /// Containing entity (comment -> comment, comment -> post). Only comments form trees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub sequence_key: SequenceKey,
    #[serde(default)]
    pub payload: Payload,
    /// Optimistic local value not yet confirmed by the server
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
}

impl Entity {
    pub fn new(id: impl Into<String>, kind: EntityKind, sequence_key: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            parent_id: None,
            sequence_key: SequenceKey(sequence_key),
            payload: Payload::default(),
            pending: false,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.payload.text = Some(text.into());
        self
    }

    pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
        self.payload.author_id = Some(author_id.into());
        self
    }

    pub fn as_pending(mut self) -> Self {
        self.pending = true;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.payload.is_deleted == Some(true)
    }

    pub fn text(&self) -> &str {
        self.payload.text.as_deref().unwrap_or("")
    }

    pub fn has_reaction(&self, reaction: &str) -> bool {
        self.payload
            .my_reactions
            .as_ref()
            .is_some_and(|r| r.contains(reaction))
    }

    pub fn reaction_count(&self, reaction: &str) -> u64 {
        self.payload
            .reaction_counts
            .as_ref()
            .and_then(|c| c.get(reaction).copied())
            .unwrap_or(0)
    }

    /// Set the viewer's reaction, moving the count only when membership changes.
    /// Returns whether anything changed.
    pub fn set_reaction(&mut self, reaction: &str, present: bool) -> bool {
        if self.has_reaction(reaction) == present {
            return false;
        }

        let mine = self.payload.my_reactions.get_or_insert_with(BTreeSet::new);
        let counts = self.payload.reaction_counts.get_or_insert_with(BTreeMap::new);
        let count = counts.entry(reaction.to_string()).or_insert(0);
        if present {
            mine.insert(reaction.to_string());
            *count += 1;
        } else {
            mine.remove(reaction);
            *count = count.saturating_sub(1);
        }
        true
    }

    pub fn is_flagged_by_me(&self) -> bool {
        self.payload.flagged_by_me == Some(true)
    }

    pub fn flag_count(&self) -> u32 {
        self.payload.flag_count.unwrap_or(0)
    }

    pub fn set_flag(&mut self, present: bool) -> bool {
        if self.is_flagged_by_me() == present {
            return false;
        }
        let count = self.flag_count();
        self.payload.flagged_by_me = Some(present);
        self.payload.flag_count = Some(if present {
            count + 1
        } else {
            count.saturating_sub(1)
        });
        true
    }
}
