//! In-process `SyncBackend`.
//!
//! Holds entities per scope and serves offset-free cursor pages keyed on the
//! sequence key and id. Tests drive it directly: scripted pages, injected failures,
//! pushed realtime events and held calls that are released in a chosen order
//! to reproduce response races.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::backend::{EventSink, RealtimeEvent, Subscription, SyncBackend, ToggleOp};
use crate::error::SyncError;
use crate::models::{Cursor, Entity, EntityKind, Page, PageDirection, PageRequest, Scope};
use crate::store::views::compare;

/// Backend operations, for failure injection and holding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Subscribe,
    Query,
    FetchOne,
    Reaction,
    Flag,
    Delete,
    Edit,
    Create,
}

/// A call parked until the test releases it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldCall {
    pub ticket: u64,
    pub op: Op,
    /// Entity id, or scope for queries
    pub target: String,
}

#[derive(Default)]
struct Inner {
    entities: HashMap<Scope, Vec<Entity>>,
    scripted: HashMap<(Scope, Option<Cursor>), VecDeque<Page>>,
    failures: HashMap<Op, VecDeque<SyncError>>,
    held_ops: HashSet<Op>,
    held: Vec<(HeldCall, oneshot::Sender<Result<(), SyncError>>)>,
    sinks: HashMap<Scope, Vec<(u64, EventSink)>>,
    queries: Vec<(Scope, PageRequest)>,
    mutations: Vec<(Op, String)>,
    next_ticket: u64,
}

impl Inner {
    fn find_mut(&mut self, id: &str) -> Option<(&Scope, &mut Entity)> {
        self.entities
            .iter_mut()
            .find_map(|(scope, list)| list.iter_mut().find(|e| e.id == id).map(|e| (scope, e)))
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Seeding =====

    pub fn seed(&self, scope: Scope, entities: impl IntoIterator<Item = Entity>) {
        let mut inner = self.inner.lock();
        let list = inner.entities.entry(scope).or_default();
        for entity in entities {
            list.retain(|e| e.id != entity.id);
            list.push(entity);
        }
    }

    /// Serve `page` (once) for the next query of `scope` with exactly `cursor`.
    pub fn script_page(&self, scope: Scope, cursor: Option<Cursor>, page: Page) {
        self.inner
            .lock()
            .scripted
            .entry((scope, cursor))
            .or_default()
            .push_back(page);
    }

    pub fn fail_next(&self, op: Op, error: SyncError) {
        self.inner
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    // ===== Holding =====

    /// Park every subsequent call of `op` until released.
    pub fn hold(&self, op: Op) {
        self.inner.lock().held_ops.insert(op);
    }

    pub fn held(&self) -> Vec<HeldCall> {
        self.inner.lock().held.iter().map(|(c, _)| c.clone()).collect()
    }

    /// Resume a parked call with `result`. Returns false for an unknown ticket.
    pub fn release(&self, ticket: u64, result: Result<(), SyncError>) -> bool {
        let sender = {
            let mut inner = self.inner.lock();
            let Some(pos) = inner.held.iter().position(|(c, _)| c.ticket == ticket) else {
                return false;
            };
            inner.held.remove(pos).1
        };
        sender.send(result).is_ok()
    }

    // ===== Realtime =====

    /// Deliver `event` to every live subscriber of `scope`. Upserts and removals
    /// are also applied to the backend's own data. Returns the number of receivers.
    pub fn push(&self, scope: &Scope, event: RealtimeEvent) -> usize {
        let mut inner = self.inner.lock();
        match &event {
            RealtimeEvent::Upsert(entity) => {
                let list = inner.entities.entry(scope.clone()).or_default();
                match list.iter_mut().find(|e| e.id == entity.id) {
                    Some(existing) => {
                        existing.sequence_key = existing.sequence_key.max(entity.sequence_key);
                        existing.payload.merge(entity.payload.clone());
                    }
                    None => list.push(entity.clone()),
                }
            }
            RealtimeEvent::Remove { id } => {
                if let Some((_, entity)) = inner.find_mut(id) {
                    entity.payload.is_deleted = Some(true);
                }
            }
            RealtimeEvent::Lost { .. } => {}
        }

        let Some(sinks) = inner.sinks.get_mut(scope) else {
            return 0;
        };
        sinks.retain(|(_, sink)| !sink.is_closed());
        sinks
            .iter()
            .filter(|(_, sink)| sink.send(event.clone()).is_ok())
            .count()
    }

    /// Drop the realtime channel of `scope` the way a flaky connection would.
    pub fn disconnect(&self, scope: &Scope, reason: &str) {
        let sinks = self.inner.lock().sinks.remove(scope).unwrap_or_default();
        for (_, sink) in sinks {
            let _ = sink.send(RealtimeEvent::Lost {
                reason: reason.to_string(),
            });
        }
    }

    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        self.inner
            .lock()
            .sinks
            .get(scope)
            .map(|s| s.iter().filter(|(_, sink)| !sink.is_closed()).count())
            .unwrap_or(0)
    }

    // ===== Inspection =====

    pub fn queries(&self) -> Vec<(Scope, PageRequest)> {
        self.inner.lock().queries.clone()
    }

    pub fn mutations(&self) -> Vec<(Op, String)> {
        self.inner.lock().mutations.clone()
    }

    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.inner.lock().find_mut(id).map(|(_, e)| e.clone())
    }

    async fn gate(&self, op: Op, target: &str) -> Result<(), SyncError> {
        let waiter = {
            let mut inner = self.inner.lock();
            if let Some(error) = inner.failures.get_mut(&op).and_then(|q| q.pop_front()) {
                return Err(error);
            }
            if !inner.held_ops.contains(&op) {
                return Ok(());
            }
            inner.next_ticket += 1;
            let call = HeldCall {
                ticket: inner.next_ticket,
                op,
                target: target.to_string(),
            };
            let (tx, rx) = oneshot::channel();
            inner.held.push((call, tx));
            rx
        };
        waiter
            .await
            .unwrap_or_else(|_| Err(SyncError::network("held call dropped")))
    }

    fn with_entity<T>(
        &self,
        op: Op,
        id: &str,
        f: impl FnOnce(&mut Entity) -> T,
    ) -> Result<T, SyncError> {
        let mut inner = self.inner.lock();
        inner.mutations.push((op, id.to_string()));
        let (_, entity) = inner.find_mut(id).ok_or_else(|| SyncError::NotFound {
            id: id.to_string(),
        })?;
        Ok(f(entity))
    }
}

#[async_trait]
impl SyncBackend for MemoryBackend {
    fn subscribe(&self, scope: &Scope, sink: EventSink) -> Result<Subscription, SyncError> {
        let mut inner = self.inner.lock();
        if let Some(error) = inner
            .failures
            .get_mut(&Op::Subscribe)
            .and_then(|q| q.pop_front())
        {
            return Err(error);
        }
        inner.next_ticket += 1;
        let token = inner.next_ticket;
        inner
            .sinks
            .entry(scope.clone())
            .or_default()
            .push((token, sink));
        debug!(%scope, token, "memory backend subscribed");

        let state = Arc::downgrade(&self.inner);
        let scope = scope.clone();
        Ok(Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                if let Some(sinks) = state.lock().sinks.get_mut(&scope) {
                    sinks.retain(|(t, _)| *t != token);
                }
            }
        }))
    }

    async fn query_page(&self, scope: &Scope, request: PageRequest) -> Result<Page, SyncError> {
        self.inner.lock().queries.push((scope.clone(), request.clone()));
        self.gate(Op::Query, &scope.to_string()).await?;

        let mut inner = self.inner.lock();
        if let Some(page) = inner
            .scripted
            .get_mut(&(scope.clone(), request.cursor.clone()))
            .and_then(|q| q.pop_front())
        {
            return Ok(page);
        }

        let mut all: Vec<&Entity> = inner
            .entities
            .get(scope)
            .map(|list| list.iter().filter(|e| !e.is_deleted()).collect())
            .unwrap_or_default();
        all.sort_by(|a, b| compare(a, b));

        let bound = match &request.cursor {
            None => None,
            Some(cursor) => Some(parse_cursor(cursor)?),
        };
        let page = match (&bound, request.direction) {
            (None, _) => window_before(&all, None, request.limit),
            (Some(b), PageDirection::Before) => window_before(&all, Some(b), request.limit),
            (Some(b), PageDirection::After) => window_after(&all, b, request.limit),
        };
        Ok(page)
    }

    async fn fetch_one(&self, _kind: EntityKind, id: &str) -> Result<Entity, SyncError> {
        self.gate(Op::FetchOne, id).await?;
        self.inner
            .lock()
            .find_mut(id)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| SyncError::NotFound { id: id.to_string() })
    }

    async fn mutate_reaction(
        &self,
        _kind: EntityKind,
        id: &str,
        reaction: &str,
        op: ToggleOp,
    ) -> Result<(), SyncError> {
        self.gate(Op::Reaction, id).await?;
        self.with_entity(Op::Reaction, id, |e| {
            e.set_reaction(reaction, op.is_add());
        })
    }

    async fn mutate_flag(
        &self,
        _kind: EntityKind,
        id: &str,
        op: ToggleOp,
    ) -> Result<(), SyncError> {
        self.gate(Op::Flag, id).await?;
        self.with_entity(Op::Flag, id, |e| {
            e.set_flag(op.is_add());
        })
    }

    async fn mutate_delete(&self, _kind: EntityKind, id: &str) -> Result<(), SyncError> {
        self.gate(Op::Delete, id).await?;
        self.with_entity(Op::Delete, id, |e| {
            e.payload.is_deleted = Some(true);
        })
    }

    async fn mutate_edit(
        &self,
        _kind: EntityKind,
        id: &str,
        text: &str,
    ) -> Result<Entity, SyncError> {
        self.gate(Op::Edit, id).await?;
        self.with_entity(Op::Edit, id, |e| {
            e.payload.text = Some(text.to_string());
            e.payload.edited_at = Some(Utc::now());
            e.clone()
        })
    }

    async fn mutate_create(&self, scope: &Scope, entity: Entity) -> Result<Entity, SyncError> {
        self.gate(Op::Create, &entity.id).await?;
        let mut inner = self.inner.lock();
        inner.mutations.push((Op::Create, entity.id.clone()));
        let list = inner.entities.entry(scope.clone()).or_default();
        let next_key = list
            .iter()
            .map(|e| e.sequence_key)
            .max()
            .unwrap_or_default()
            .next();

        let mut stored = Entity {
            pending: false,
            sequence_key: next_key.max(entity.sequence_key),
            ..entity
        };
        stored.payload.created_at = Some(Utc::now());
        list.retain(|e| e.id != stored.id);
        list.push(stored.clone());
        Ok(stored)
    }
}

/// Cursors name the boundary entity as `seq:<key>:<id>` so entities sharing
/// a sequence key still page in `compare` order.
fn parse_cursor(cursor: &Cursor) -> Result<Entity, SyncError> {
    cursor
        .as_str()
        .strip_prefix("seq:")
        .and_then(|rest| rest.split_once(':'))
        .and_then(|(key, id)| {
            let key: u64 = key.parse().ok()?;
            (!id.is_empty()).then(|| Entity::new(id, EntityKind::Message, key))
        })
        .ok_or_else(|| SyncError::validation(format!("unknown cursor {:?}", cursor.as_str())))
}

fn seq_cursor(entity: &Entity) -> Cursor {
    Cursor::new(format!("seq:{}:{}", entity.sequence_key.0, entity.id))
}

/// Newest `limit` entities ordered before `boundary`. The initial window has
/// no boundary and no after-cursor: newer entities arrive over the realtime
/// channel.
fn window_before(all: &[&Entity], boundary: Option<&Entity>, limit: usize) -> Page {
    let below: Vec<&Entity> = all
        .iter()
        .copied()
        .filter(|e| boundary.map_or(true, |b| compare(e, b) == Ordering::Less))
        .collect();
    let start = below.len().saturating_sub(limit);
    let entities: Vec<Entity> = below[start..].iter().map(|e| (*e).clone()).collect();

    let before = if start > 0 {
        entities.first().map(seq_cursor)
    } else {
        None
    };
    let after = match boundary {
        None => None,
        Some(_) => entities.last().map(seq_cursor),
    };
    Page {
        entities,
        before,
        after,
    }
}

/// Oldest `limit` entities ordered after `boundary`.
fn window_after(all: &[&Entity], boundary: &Entity, limit: usize) -> Page {
    let above: Vec<&Entity> = all
        .iter()
        .copied()
        .filter(|e| compare(e, boundary) == Ordering::Greater)
        .collect();
    let end = above.len().min(limit);
    let entities: Vec<Entity> = above[..end].iter().map(|e| (*e).clone()).collect();

    let after = if end < above.len() {
        entities.last().map(seq_cursor)
    } else {
        None
    };
    let before = entities.first().map(seq_cursor);
    Page {
        entities,
        before,
        after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Scope {
        Scope::Channel("general".to_string())
    }

    fn seed_messages(backend: &MemoryBackend, count: u64) {
        backend.seed(
            channel(),
            (1..=count).map(|i| Entity::new(format!("m{}", i), EntityKind::Message, i)),
        );
    }

    fn ids(page: &Page) -> Vec<&str> {
        page.entities.iter().map(|e| e.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_initial_window_is_newest() {
        let backend = MemoryBackend::new();
        seed_messages(&backend, 5);

        let page = backend
            .query_page(&channel(), PageRequest::initial(2))
            .await
            .unwrap();
        assert_eq!(ids(&page), vec!["m4", "m5"]);
        assert_eq!(page.before, Some(Cursor::new("seq:4:m4")));
        assert_eq!(page.after, None);
    }

    #[tokio::test]
    async fn test_walk_backwards_until_exhausted() {
        let backend = MemoryBackend::new();
        seed_messages(&backend, 3);
        let request = PageRequest {
            cursor: Some(Cursor::new("seq:3:m3")),
            direction: PageDirection::Before,
            limit: 2,
        };

        let page = backend.query_page(&channel(), request).await.unwrap();
        assert_eq!(ids(&page), vec!["m1", "m2"]);
        assert_eq!(page.before, None);
    }

    #[tokio::test]
    async fn test_walk_backwards_across_tied_sequence_keys() {
        let backend = MemoryBackend::new();
        backend.seed(
            channel(),
            [("a", 1), ("b", 2), ("c", 2), ("d", 3)]
                .into_iter()
                .map(|(id, seq)| Entity::new(id, EntityKind::Message, seq)),
        );

        let mut page = backend
            .query_page(&channel(), PageRequest::initial(2))
            .await
            .unwrap();
        assert_eq!(ids(&page), vec!["c", "d"]);
        assert_eq!(page.before, Some(Cursor::new("seq:2:c")));

        let mut seen: Vec<String> = page.entities.iter().map(|e| e.id.clone()).collect();
        while let Some(cursor) = page.before.clone() {
            let request = PageRequest {
                cursor: Some(cursor),
                direction: PageDirection::Before,
                limit: 2,
            };
            page = backend.query_page(&channel(), request).await.unwrap();
            seen.extend(page.entities.iter().map(|e| e.id.clone()));
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_malformed_cursor_is_rejected() {
        let backend = MemoryBackend::new();
        seed_messages(&backend, 2);
        let request = PageRequest {
            cursor: Some(Cursor::new("seq:2")),
            direction: PageDirection::Before,
            limit: 2,
        };
        assert!(matches!(
            backend.query_page(&channel(), request).await,
            Err(SyncError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_scripted_page_takes_precedence() {
        let backend = MemoryBackend::new();
        seed_messages(&backend, 3);
        backend.script_page(channel(), None, Page::default());

        let page = backend
            .query_page(&channel(), PageRequest::initial(10))
            .await
            .unwrap();
        assert!(page.entities.is_empty());

        let page = backend
            .query_page(&channel(), PageRequest::initial(10))
            .await
            .unwrap();
        assert_eq!(page.entities.len(), 3);
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let backend = MemoryBackend::new();
        backend.fail_next(Op::FetchOne, SyncError::network("offline"));
        seed_messages(&backend, 1);

        assert!(backend.fetch_one(EntityKind::Message, "m1").await.is_err());
        assert!(backend.fetch_one(EntityKind::Message, "m1").await.is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_sink() {
        let backend = MemoryBackend::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = backend.subscribe(&channel(), tx).unwrap();
        assert_eq!(backend.subscriber_count(&channel()), 1);

        let event = RealtimeEvent::Upsert(Entity::new("m1", EntityKind::Message, 1));
        assert_eq!(backend.push(&channel(), event.clone()), 1);
        assert_eq!(rx.recv().await, Some(event));

        subscription.cancel();
        assert_eq!(backend.subscriber_count(&channel()), 0);
        assert_eq!(
            backend.push(&channel(), RealtimeEvent::Remove { id: "m1".to_string() }),
            0
        );
    }

    #[tokio::test]
    async fn test_held_call_released_with_error() {
        let backend = MemoryBackend::new();
        seed_messages(&backend, 1);
        backend.hold(Op::Delete);

        let task = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.mutate_delete(EntityKind::Message, "m1").await })
        };
        while backend.held().is_empty() {
            tokio::task::yield_now().await;
        }
        let call = backend.held().remove(0);
        assert_eq!(call.op, Op::Delete);
        assert!(backend.release(call.ticket, Err(SyncError::rejected("nope"))));

        assert_eq!(task.await.unwrap(), Err(SyncError::rejected("nope")));
        assert!(!backend.entity("m1").unwrap().is_deleted());
    }
}
