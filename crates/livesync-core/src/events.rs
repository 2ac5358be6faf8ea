use crate::error::SyncError;
use crate::models::{PageDirection, Scope};
use crate::store::Attribute;

/// Notifications emitted by a `Collection` for the UI shell.
///
/// `Changed` fires after every store mutation and is the cue to re-read the
/// projection. The failure variants are one-shot: the UI shows them as a
/// toast/banner, the collection has already rolled its state back.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Changed {
        revision: u64,
    },
    PageLoaded {
        scope: Scope,
        direction: Option<PageDirection>,
        count: usize,
    },
    PageFailed {
        scope: Scope,
        error: SyncError,
    },
    /// An optimistic change was rolled back
    MutationFailed {
        entity_id: String,
        mutation: MutationKind,
        error: SyncError,
    },
    SubscriptionLost {
        scope: Scope,
        reason: String,
    },
    SubscriptionRestored {
        scope: Scope,
    },
    /// Resubscription gave up; UI should show a persistent banner
    SubscriptionFailed {
        scope: Scope,
        error: SyncError,
    },
    /// The post a post scope hangs off was deleted; the screen should leave
    RootDeleted {
        scope: Scope,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    Toggle(Attribute),
    Delete,
    Edit,
    Create,
}
