//! Contract of the external data service.
//!
//! The engine never talks to the network itself: persistence, transport and
//! reaction bookkeeping live behind `SyncBackend`. `memory::MemoryBackend`
//! is the in-process implementation used by tests and the CLI.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::SyncError;
use crate::models::{Entity, EntityKind, Page, PageRequest, Scope};

/// Inbound realtime notification for a scope.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// New or changed entity (possibly partial)
    Upsert(Entity),
    /// Explicit removal signal; becomes a tombstone
    Remove { id: String },
    /// The channel dropped; the engine resubscribes
    Lost { reason: String },
}

pub type EventSink = UnboundedSender<RealtimeEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOp {
    Add,
    Remove,
}

impl ToggleOp {
    pub fn from_present(present: bool) -> Self {
        if present {
            ToggleOp::Add
        } else {
            ToggleOp::Remove
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, ToggleOp::Add)
    }
}

/// Unsubscribe handle returned by `SyncBackend::subscribe`.
///
/// The callback runs at most once: on `cancel()` or on drop.
pub struct Subscription {
    unsubscribe: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Mutex::new(Some(Box::new(unsubscribe))),
        }
    }

    /// Handle for backends without explicit teardown
    pub fn noop() -> Self {
        Self {
            unsubscribe: Mutex::new(None),
        }
    }

    pub fn cancel(&self) {
        let callback = self.unsubscribe.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.lock().is_some())
            .finish()
    }
}

#[async_trait]
pub trait SyncBackend: Send + Sync + 'static {
    /// Start pushing events for `scope` into `sink` until the handle is cancelled.
    fn subscribe(&self, scope: &Scope, sink: EventSink) -> Result<Subscription, SyncError>;

    async fn query_page(&self, scope: &Scope, request: PageRequest) -> Result<Page, SyncError>;

    async fn fetch_one(&self, kind: EntityKind, id: &str) -> Result<Entity, SyncError>;

    async fn mutate_reaction(
        &self,
        kind: EntityKind,
        id: &str,
        reaction: &str,
        op: ToggleOp,
    ) -> Result<(), SyncError>;

    async fn mutate_flag(&self, kind: EntityKind, id: &str, op: ToggleOp)
        -> Result<(), SyncError>;

    async fn mutate_delete(&self, kind: EntityKind, id: &str) -> Result<(), SyncError>;

    /// Returns the authoritative entity after the edit
    async fn mutate_edit(&self, kind: EntityKind, id: &str, text: &str)
        -> Result<Entity, SyncError>;

    /// Persist a locally created entity in `scope`; the returned entity keeps the client id
    async fn mutate_create(&self, scope: &Scope, entity: Entity) -> Result<Entity, SyncError>;
}
