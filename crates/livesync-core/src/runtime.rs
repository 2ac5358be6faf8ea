//! Live collection engine.
//!
//! A `Collection` owns one entity store per screen and merges three inputs
//! into it: cursor pages, the realtime subscription of every open scope, and
//! optimistic mutations. All state sits behind one mutex that is never held
//! across an await; each in-flight response re-checks the session it was
//! issued for and is discarded if that session has ended.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backend::{RealtimeEvent, Subscription, SyncBackend};
use crate::config::{CollectionLayout, Session, SyncConfig};
use crate::error::SyncError;
use crate::events::{MutationKind, SyncEvent};
use crate::models::{Entity, EntityKind, Page, PageDirection, PageRequest, Scope};
use crate::stats::{SharedSyncStats, SyncStats};
use crate::store::{
    apply_event, apply_page, Applied, Attribute, EntityStore, MutationLayer, PageState, Projection,
    Resolution, ToggleState, ToggleTicket, ViewItem, ViewNode,
};

/// Realtime channel health of one scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Reconnecting { attempt: u32 },
    /// Resubscription gave up
    Failed,
}

/// Result of a page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { count: usize },
    /// Not issued: already loading, or the direction is exhausted
    Skipped,
    /// Stored in the scope's `last_error` as well
    Failed(SyncError),
    /// The scope was closed while the request was in flight
    Discarded,
}

/// Content for an optimistic create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    /// Comment being replied to; None for a top-level entity
    pub parent_id: Option<String>,
}

impl Draft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parent_id: None,
        }
    }

    pub fn reply_to(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

struct ScopeState {
    session: u64,
    pages: PageState,
    status: SubscriptionStatus,
    subscription: Option<Subscription>,
    pump: Option<JoinHandle<()>>,
}

impl Drop for ScopeState {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[derive(Default)]
struct State {
    root: Option<Scope>,
    /// Bumped on every open/close; mutations check it on completion
    epoch: u64,
    next_session: u64,
    store: EntityStore,
    /// The post a post scope hangs off, once loaded or pushed
    root_post: EntityStore,
    overlay: MutationLayer,
    scopes: HashMap<Scope, ScopeState>,
}

impl State {
    fn is_live(&self, scope: &Scope, session: u64) -> bool {
        self.scopes
            .get(scope)
            .is_some_and(|s| s.session == session)
    }
}

struct Engine {
    backend: Arc<dyn SyncBackend>,
    config: SyncConfig,
    session: Session,
    layout: CollectionLayout,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<SyncEvent>,
    stats: SharedSyncStats,
}

/// Handle to a live collection; clones share the same state.
#[derive(Clone)]
pub struct Collection {
    engine: Arc<Engine>,
}

impl Collection {
    pub fn new(
        backend: Arc<dyn SyncBackend>,
        config: SyncConfig,
        session: Session,
        layout: CollectionLayout,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let engine = Engine {
            backend,
            config,
            session,
            layout,
            state: Mutex::new(State::default()),
            events,
            stats: SharedSyncStats::new(),
        };
        (
            Self {
                engine: Arc::new(engine),
            },
            events_rx,
        )
    }

    // ===== Lifecycle =====

    /// Start the session for `scope`: subscribe to its realtime channel.
    /// Re-opening the current scope is a no-op; a different scope closes the
    /// current session first. Must be called within a tokio runtime.
    pub fn open(&self, scope: Scope) -> Result<(), SyncError> {
        scope.validate()?;
        if self.engine.layout == CollectionLayout::Tree && !matches!(scope, Scope::Post(_)) {
            return Err(SyncError::validation(format!(
                "comment trees are rooted at a post, got {}",
                scope
            )));
        }

        let mut state = self.engine.state.lock();
        if state.root.as_ref() == Some(&scope) {
            return Ok(());
        }
        if state.root.is_some() {
            Engine::reset(&mut state);
        }
        state.epoch += 1;
        Engine::open_scope(&self.engine, &mut state, scope.clone())?;
        state.root = Some(scope.clone());
        info!(%scope, "collection opened");
        Ok(())
    }

    /// End the session: cancel every subscription, discard the store, and
    /// make any response still in flight a no-op.
    pub fn close(&self) {
        let mut state = self.engine.state.lock();
        if let Some(scope) = &state.root {
            info!(%scope, "collection closed");
        }
        Engine::reset(&mut state);
        state.epoch += 1;
        self.engine.publish(&state);
    }

    pub fn scope(&self) -> Option<Scope> {
        self.engine.state.lock().root.clone()
    }

    pub fn is_open(&self) -> bool {
        self.engine.state.lock().root.is_some()
    }

    // ===== Pagination =====

    pub async fn load_initial(&self) -> Result<LoadOutcome, SyncError> {
        let scope = self.root()?;
        Ok(self.engine.load_initial(scope).await)
    }

    pub async fn load_more(&self, direction: PageDirection) -> Result<LoadOutcome, SyncError> {
        let scope = self.root()?;
        Ok(self.engine.load_more(scope, direction).await)
    }

    /// Open the reply thread of `comment_id`: its own subscription and
    /// cursor state, queried only now that the node is expanded.
    pub async fn expand(&self, comment_id: &str) -> Result<LoadOutcome, SyncError> {
        if self.engine.layout != CollectionLayout::Tree {
            return Err(SyncError::validation("only comment trees expand"));
        }
        self.root()?;
        let scope = Scope::Comment(comment_id.to_string());
        scope.validate()?;
        {
            let mut state = self.engine.state.lock();
            if state.scopes.contains_key(&scope) {
                return Ok(LoadOutcome::Skipped);
            }
            Engine::open_scope(&self.engine, &mut state, scope.clone())?;
        }
        Ok(self.engine.load_initial(scope).await)
    }

    /// Stop live updates and pagination for a reply thread. Loaded replies stay in the store.
    pub fn collapse(&self, comment_id: &str) {
        let scope = Scope::Comment(comment_id.to_string());
        let removed = self.engine.state.lock().scopes.remove(&scope);
        if removed.is_some() {
            debug!(%scope, "reply thread collapsed");
        }
    }

    pub async fn load_more_replies(&self, comment_id: &str) -> Result<LoadOutcome, SyncError> {
        let scope = Scope::Comment(comment_id.to_string());
        if !self.engine.state.lock().scopes.contains_key(&scope) {
            return Err(SyncError::Closed);
        }
        Ok(self
            .engine
            .load_more(scope, PageDirection::Before)
            .await)
    }

    // ===== Mutations =====

    pub async fn toggle_reaction(
        &self,
        entity_id: &str,
        reaction: &str,
    ) -> Result<ToggleState, SyncError> {
        self.engine
            .toggle(entity_id, Attribute::reaction(reaction))
            .await
    }

    pub async fn toggle_flag(&self, entity_id: &str) -> Result<ToggleState, SyncError> {
        self.engine.toggle(entity_id, Attribute::Flag).await
    }

    pub async fn delete(&self, entity_id: &str) -> Result<(), SyncError> {
        self.engine.delete(entity_id).await
    }

    pub async fn edit(&self, entity_id: &str, text: &str) -> Result<(), SyncError> {
        self.engine.edit(entity_id, text).await
    }

    /// Insert `draft` optimistically under a client id and persist it.
    /// Returns the id, which the confirmed entity keeps.
    pub async fn create(&self, draft: Draft) -> Result<String, SyncError> {
        self.engine.create(draft).await
    }

    /// Re-read one entity; merged under the same rules as pushed updates.
    pub async fn refresh(&self, entity_id: &str) -> Result<(), SyncError> {
        self.engine.refresh(entity_id).await
    }

    /// Fetch the post a post scope is rooted at. Later pushes for it on the
    /// scope's channel keep it current; `SyncEvent::RootDeleted` fires once
    /// it is gone.
    pub async fn load_root(&self) -> Result<Entity, SyncError> {
        let Scope::Post(post_id) = self.root()? else {
            return Err(SyncError::validation("only post scopes have a root post"));
        };
        self.engine.load_root(&post_id).await
    }

    pub fn root_entity(&self) -> Option<Entity> {
        let state = self.engine.state.lock();
        let Some(Scope::Post(post_id)) = state.root.as_ref() else {
            return None;
        };
        state.root_post.get(post_id).cloned()
    }

    // ===== Views =====

    pub fn view(&self) -> Vec<ViewItem> {
        let state = self.engine.state.lock();
        self.engine.projection(&state).list()
    }

    pub fn tree(&self) -> Vec<ViewNode> {
        let state = self.engine.state.lock();
        let Some(root) = state.root.as_ref() else {
            return Vec::new();
        };
        self.engine.projection(&state).tree(root.id(), |id| {
            state
                .scopes
                .get(&Scope::Comment(id.to_string()))
                .map(|s| s.pages.has_more(PageDirection::Before))
        })
    }

    pub fn get(&self, entity_id: &str) -> Option<Entity> {
        self.engine.state.lock().store.get(entity_id).cloned()
    }

    pub fn reaction_state(&self, entity_id: &str, reaction: &str) -> Option<ToggleState> {
        let state = self.engine.state.lock();
        let entity = state.store.get(entity_id)?;
        Some(state.overlay.state(entity, &Attribute::reaction(reaction)))
    }

    pub fn flag_state(&self, entity_id: &str) -> Option<ToggleState> {
        let state = self.engine.state.lock();
        let entity = state.store.get(entity_id)?;
        Some(state.overlay.state(entity, &Attribute::Flag))
    }

    pub fn page_state(&self, scope: &Scope) -> Option<PageState> {
        self.engine
            .state
            .lock()
            .scopes
            .get(scope)
            .map(|s| s.pages.clone())
    }

    pub fn subscription_status(&self, scope: &Scope) -> Option<SubscriptionStatus> {
        self.engine.state.lock().scopes.get(scope).map(|s| s.status)
    }

    /// Observes the store revision; changes whenever the projection may differ.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.engine.state.lock().store.subscribe()
    }

    pub fn stats(&self) -> SyncStats {
        self.engine.stats.snapshot()
    }

    fn root(&self) -> Result<Scope, SyncError> {
        self.engine
            .state
            .lock()
            .root
            .clone()
            .ok_or(SyncError::Closed)
    }
}

impl Engine {
    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self, state: &State) {
        self.emit(SyncEvent::Changed {
            revision: state.store.revision(),
        });
    }

    fn projection<'a>(&'a self, state: &'a State) -> Projection<'a> {
        Projection {
            store: &state.store,
            overlay: &state.overlay,
            session: &self.session,
            order: self.config.order_for(self.layout),
        }
    }

    fn entity_kind(state: &State) -> Result<EntityKind, SyncError> {
        state
            .root
            .as_ref()
            .map(Scope::entity_kind)
            .ok_or(SyncError::Closed)
    }

    fn reset(state: &mut State) {
        // ScopeState's Drop cancels the subscription and aborts the pump
        state.scopes.clear();
        state.root = None;
        state.overlay.clear();
        state.store.clear();
        state.root_post.clear();
    }

    /// Register `scope` and start its realtime subscription. A transport
    /// failure here is treated like a dropped channel; a validation failure
    /// is returned.
    fn open_scope(engine: &Arc<Engine>, state: &mut State, scope: Scope) -> Result<(), SyncError> {
        state.next_session += 1;
        let session = state.next_session;

        let (sink, receiver) = mpsc::unbounded_channel();
        let (subscription, receiver, status) = match engine.backend.subscribe(&scope, sink) {
            Ok(subscription) => (Some(subscription), Some(receiver), SubscriptionStatus::Active),
            Err(error @ SyncError::Validation { .. }) => return Err(error),
            Err(error) => {
                warn!(%scope, "initial subscribe failed: {}", error);
                engine.emit(SyncEvent::SubscriptionLost {
                    scope: scope.clone(),
                    reason: error.to_string(),
                });
                (None, None, SubscriptionStatus::Reconnecting { attempt: 0 })
            }
        };

        let pump = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::validation("collection opened outside a tokio runtime"))?
            .spawn(pump(Arc::downgrade(engine), scope.clone(), session, receiver));

        state.scopes.insert(
            scope,
            ScopeState {
                session,
                pages: PageState::new(),
                status,
                subscription,
                pump: Some(pump),
            },
        );
        Ok(())
    }

    // ===== Realtime =====

    /// Returns false once the scope session is gone, which stops the pump.
    fn apply_realtime(&self, scope: &Scope, session: u64, event: RealtimeEvent) -> bool {
        let mut state = self.state.lock();
        if !state.is_live(scope, session) {
            trace!(%scope, "dropping event for closed scope");
            return false;
        }
        let Ok(kind) = Engine::entity_kind(&state) else {
            return false;
        };
        if let Some(Scope::Post(post_id)) = state.root.as_ref().filter(|root| *root == scope) {
            if targets(&event, post_id) {
                let post_id = post_id.clone();
                self.apply_root(&mut state, scope, &post_id, event);
                return true;
            }
        }
        let applied = apply_event(&mut state.store, kind, event);
        self.stats
            .update(|s| s.record_event(&scope.to_string(), &applied));
        if applied.changed() {
            self.publish(&state);
        }
        true
    }

    fn apply_root(&self, state: &mut State, scope: &Scope, post_id: &str, event: RealtimeEvent) {
        let was_deleted = state.root_post.get(post_id).is_some_and(Entity::is_deleted);
        let applied = apply_event(&mut state.root_post, EntityKind::Post, event);
        self.stats
            .update(|s| s.record_event(&scope.to_string(), &applied));
        if !applied.changed() {
            return;
        }
        if !was_deleted && state.root_post.get(post_id).is_some_and(Entity::is_deleted) {
            info!(%scope, "root post deleted");
            self.emit(SyncEvent::RootDeleted {
                scope: scope.clone(),
            });
        }
        self.publish(state);
    }

    fn subscription_lost(&self, scope: &Scope, session: u64, reason: &str) -> bool {
        let mut state = self.state.lock();
        let Some(scope_state) = state.scopes.get_mut(scope).filter(|s| s.session == session) else {
            return false;
        };
        warn!(%scope, %reason, "realtime subscription lost");
        scope_state.subscription = None;
        scope_state.status = SubscriptionStatus::Reconnecting { attempt: 0 };
        self.emit(SyncEvent::SubscriptionLost {
            scope: scope.clone(),
            reason: reason.to_string(),
        });
        true
    }

    fn resubscribe(&self, scope: &Scope, session: u64, attempt: u32) -> Resubscribe {
        let mut state = self.state.lock();
        let Some(scope_state) = state.scopes.get_mut(scope).filter(|s| s.session == session) else {
            return Resubscribe::Gone;
        };
        scope_state.status = SubscriptionStatus::Reconnecting { attempt };
        self.stats.update(|s| s.resubscribes += 1);

        let (sink, receiver) = mpsc::unbounded_channel();
        match self.backend.subscribe(scope, sink) {
            Ok(subscription) => {
                scope_state.subscription = Some(subscription);
                scope_state.status = SubscriptionStatus::Active;
                info!(%scope, attempt, "realtime subscription restored");
                self.emit(SyncEvent::SubscriptionRestored {
                    scope: scope.clone(),
                });
                Resubscribe::Restored(receiver)
            }
            Err(error) => {
                warn!(%scope, attempt, "resubscribe failed: {}", error);
                Resubscribe::Failed
            }
        }
    }

    fn subscription_failed(&self, scope: &Scope, session: u64) {
        let mut state = self.state.lock();
        let Some(scope_state) = state.scopes.get_mut(scope).filter(|s| s.session == session) else {
            return;
        };
        scope_state.status = SubscriptionStatus::Failed;
        let error = SyncError::SubscriptionLost {
            scope: scope.to_string(),
            reason: format!(
                "gave up after {} attempts",
                self.config.max_resubscribe_attempts
            ),
        };
        warn!(%scope, "{}", error);
        self.emit(SyncEvent::SubscriptionFailed {
            scope: scope.clone(),
            error,
        });
    }

    /// After a reconnect, re-read the newest window so events missed while
    /// disconnected are merged. Cursors are left alone.
    async fn catch_up(&self, scope: &Scope, session: u64) {
        let request = PageRequest::initial(self.config.page_size);
        let result = self.backend.query_page(scope, request).await;

        let mut state = self.state.lock();
        if !state.is_live(scope, session) {
            return;
        }
        match result {
            Ok(page) => {
                let Ok(kind) = Engine::entity_kind(&state) else {
                    return;
                };
                if apply_page(&mut state.store, kind, page.entities) > 0 {
                    self.publish(&state);
                }
            }
            Err(error) => debug!(%scope, "catch-up query failed: {}", error),
        }
    }

    // ===== Pagination =====

    async fn load_initial(&self, scope: Scope) -> LoadOutcome {
        let (request, session, mark) = {
            let mut state = self.state.lock();
            let revision = state.store.revision();
            let Some(scope_state) = state.scopes.get_mut(&scope) else {
                return LoadOutcome::Skipped;
            };
            if scope_state.pages.is_loading_initial {
                return LoadOutcome::Skipped;
            }
            let request = scope_state.pages.begin_initial(self.config.page_size);
            (request, scope_state.session, revision)
        };

        debug!(%scope, limit = request.limit, "loading initial page");
        let result = self.backend.query_page(&scope, request).await;
        self.finish_page(&scope, session, None, mark, result)
    }

    async fn load_more(&self, scope: Scope, direction: PageDirection) -> LoadOutcome {
        let (request, session) = {
            let mut state = self.state.lock();
            let Some(scope_state) = state.scopes.get_mut(&scope) else {
                return LoadOutcome::Skipped;
            };
            let Some(request) = scope_state
                .pages
                .begin_more(direction, self.config.page_size)
            else {
                trace!(%scope, ?direction, "load more skipped");
                return LoadOutcome::Skipped;
            };
            (request, scope_state.session)
        };

        debug!(%scope, ?direction, "loading next page");
        let result = self.backend.query_page(&scope, request).await;
        self.finish_page(&scope, session, Some(direction), 0, result)
    }

    /// Merge a page response. `direction` None marks the initial window,
    /// which replaces what the previous initial load of this scope brought in.
    fn finish_page(
        &self,
        scope: &Scope,
        session: u64,
        direction: Option<PageDirection>,
        mark: u64,
        result: Result<Page, SyncError>,
    ) -> LoadOutcome {
        let mut state = self.state.lock();
        if !state.is_live(scope, session) {
            debug!(%scope, "discarding page for closed scope");
            self.stats.update(|s| s.responses_discarded += 1);
            return LoadOutcome::Discarded;
        }
        let Ok(kind) = Engine::entity_kind(&state) else {
            return LoadOutcome::Discarded;
        };

        let page = match result {
            Ok(page) => page,
            Err(error) => {
                warn!(%scope, "page query failed: {}", error);
                if let Some(scope_state) = state.scopes.get_mut(scope) {
                    match direction {
                        None => scope_state.pages.fail_initial(error.clone()),
                        Some(_) => scope_state.pages.fail_more(error.clone()),
                    }
                }
                self.stats.update(|s| s.page_failures += 1);
                self.emit(SyncEvent::PageFailed {
                    scope: scope.clone(),
                    error: error.clone(),
                });
                return LoadOutcome::Failed(error);
            }
        };

        let count = page.entities.len();
        let State { store, scopes, .. } = &mut *state;
        let Some(scope_state) = scopes.get_mut(scope) else {
            return LoadOutcome::Discarded;
        };
        match direction {
            None => {
                if scope_state.pages.initialized {
                    let root_id = scope.id().to_string();
                    let layout = self.layout;
                    let dropped = store.retain_since(mark, |e| {
                        in_window(layout, scope, &root_id, e.parent_id.as_deref())
                    });
                    trace!(%scope, dropped, "replaced initial window");
                }
                scope_state.pages.complete_initial(&page);
            }
            Some(direction) => scope_state.pages.complete_more(direction, &page),
        }
        apply_page(store, kind, page.entities);

        self.stats.update(|s| s.pages_loaded += 1);
        self.emit(SyncEvent::PageLoaded {
            scope: scope.clone(),
            direction,
            count,
        });
        self.publish(&state);
        LoadOutcome::Loaded { count }
    }

    // ===== Optimistic mutations =====

    async fn toggle(
        &self,
        entity_id: &str,
        attribute: Attribute,
    ) -> Result<ToggleState, SyncError> {
        let (ticket, kind, epoch) = {
            let mut state = self.state.lock();
            let kind = Engine::entity_kind(&state)?;
            let entity = confirmed_entity(&state, entity_id)?.clone();
            let ticket = state.overlay.toggle(&entity, attribute);
            state.store.notify();
            self.publish(&state);
            (ticket, kind, state.epoch)
        };

        debug!(
            id = entity_id,
            attribute = ?ticket.attribute,
            request = ticket.request,
            op = ?ticket.op,
            "toggle issued"
        );
        let result = match &ticket.attribute {
            Attribute::Reaction(reaction) => {
                self.backend
                    .mutate_reaction(kind, entity_id, reaction, ticket.op)
                    .await
            }
            Attribute::Flag => self.backend.mutate_flag(kind, entity_id, ticket.op).await,
        };

        let mut state = self.state.lock();
        if state.epoch != epoch {
            self.stats.update(|s| s.responses_discarded += 1);
            return Err(SyncError::Closed);
        }
        match result {
            Ok(()) => self.settle_toggle(&mut state, &ticket),
            Err(error) => {
                if state.overlay.reject(&ticket) == Resolution::RolledBack {
                    warn!(id = entity_id, "toggle rolled back: {}", error);
                    self.stats.update(|s| s.mutations_rolled_back += 1);
                    self.emit(SyncEvent::MutationFailed {
                        entity_id: entity_id.to_string(),
                        mutation: MutationKind::Toggle(ticket.attribute.clone()),
                        error: error.clone(),
                    });
                    state.store.notify();
                    self.publish(&state);
                }
                return Err(error);
            }
        }

        let entity = state
            .store
            .get(entity_id)
            .ok_or_else(|| SyncError::NotFound {
                id: entity_id.to_string(),
            })?;
        Ok(state.overlay.state(entity, &ticket.attribute))
    }

    fn settle_toggle(&self, state: &mut State, ticket: &ToggleTicket) {
        let resolution = state.overlay.acknowledge(ticket);
        trace!(
            id = %ticket.entity_id,
            request = ticket.request,
            ?resolution,
            "toggle acknowledged"
        );
        let value = match resolution {
            Resolution::Confirmed(value) => {
                self.stats.update(|s| s.mutations_confirmed += 1);
                value
            }
            Resolution::Baseline(value) => value,
            Resolution::RolledBack | Resolution::Ignored => return,
        };
        state
            .store
            .update(&ticket.entity_id, |e| ticket.attribute.write(e, value));
        state.store.notify();
        self.publish(state);
    }

    async fn delete(&self, entity_id: &str) -> Result<(), SyncError> {
        let (kind, epoch) = {
            let mut state = self.state.lock();
            let kind = Engine::entity_kind(&state)?;
            confirmed_entity(&state, entity_id)?;
            if !state.store.mark_pending_delete(entity_id) {
                return Ok(());
            }
            self.publish(&state);
            (kind, state.epoch)
        };

        let result = self.backend.mutate_delete(kind, entity_id).await;

        let mut state = self.state.lock();
        if state.epoch != epoch {
            self.stats.update(|s| s.responses_discarded += 1);
            return Err(SyncError::Closed);
        }
        match result {
            Ok(()) => {
                state.store.tombstone(entity_id, kind);
                self.stats.update(|s| s.mutations_confirmed += 1);
                self.publish(&state);
                Ok(())
            }
            Err(error) => {
                warn!(id = entity_id, "delete rolled back: {}", error);
                state.store.clear_pending_delete(entity_id);
                self.stats.update(|s| s.mutations_rolled_back += 1);
                self.emit(SyncEvent::MutationFailed {
                    entity_id: entity_id.to_string(),
                    mutation: MutationKind::Delete,
                    error: error.clone(),
                });
                self.publish(&state);
                Err(error)
            }
        }
    }

    async fn edit(&self, entity_id: &str, text: &str) -> Result<(), SyncError> {
        if text.trim().is_empty() {
            return Err(SyncError::validation("edit text is empty"));
        }
        let (ticket, kind, epoch) = {
            let mut state = self.state.lock();
            let kind = Engine::entity_kind(&state)?;
            confirmed_entity(&state, entity_id)?;
            let ticket = state.overlay.begin_edit(entity_id, text);
            state.store.notify();
            self.publish(&state);
            (ticket, kind, state.epoch)
        };

        let result = self.backend.mutate_edit(kind, entity_id, text).await;

        let mut state = self.state.lock();
        if state.epoch != epoch {
            self.stats.update(|s| s.responses_discarded += 1);
            return Err(SyncError::Closed);
        }
        let latest = state.overlay.finish_edit(&ticket);
        match result {
            Ok(entity) => {
                state.store.upsert(Entity {
                    pending: false,
                    ..entity
                });
                self.stats.update(|s| s.mutations_confirmed += 1);
                state.store.notify();
                self.publish(&state);
                Ok(())
            }
            Err(error) => {
                if latest {
                    warn!(id = entity_id, "edit rolled back: {}", error);
                    self.stats.update(|s| s.mutations_rolled_back += 1);
                    self.emit(SyncEvent::MutationFailed {
                        entity_id: entity_id.to_string(),
                        mutation: MutationKind::Edit,
                        error: error.clone(),
                    });
                    state.store.notify();
                    self.publish(&state);
                }
                Err(error)
            }
        }
    }

    async fn create(&self, draft: Draft) -> Result<String, SyncError> {
        if draft.text.trim().is_empty() {
            return Err(SyncError::validation("draft text is empty"));
        }
        let (entity, target, epoch) = {
            let mut state = self.state.lock();
            let root = state.root.clone().ok_or(SyncError::Closed)?;
            let target = match (&draft.parent_id, self.layout) {
                (Some(parent), CollectionLayout::Tree) => {
                    if !state.store.record(parent).is_some_and(|r| r.is_visible()) {
                        return Err(SyncError::NotFound { id: parent.clone() });
                    }
                    Scope::Comment(parent.clone())
                }
                _ => root.clone(),
            };

            let mut entity = Entity::new(
                uuid::Uuid::new_v4().to_string(),
                root.entity_kind(),
                state.store.max_sequence_key().next().0,
            )
            .with_text(draft.text)
            .with_author(self.session.user_id.clone())
            .as_pending();
            entity.parent_id = draft.parent_id;

            state.store.upsert(entity.clone());
            self.publish(&state);
            (entity, target, state.epoch)
        };

        let id = entity.id.clone();
        debug!(%id, scope = %target, "optimistic create");
        let result = self.backend.mutate_create(&target, entity).await;

        let mut state = self.state.lock();
        if state.epoch != epoch {
            self.stats.update(|s| s.responses_discarded += 1);
            return Err(SyncError::Closed);
        }
        match result {
            Ok(confirmed) => {
                if confirmed.id != id {
                    warn!(expected = %id, got = %confirmed.id, "backend changed the client id");
                }
                state.store.upsert(Entity {
                    pending: false,
                    ..confirmed
                });
                self.stats.update(|s| s.mutations_confirmed += 1);
                self.publish(&state);
                Ok(id)
            }
            Err(error) => {
                warn!(%id, "create rolled back: {}", error);
                if state.store.get(&id).is_some_and(|e| e.pending) {
                    state.store.remove(&id);
                }
                self.stats.update(|s| s.mutations_rolled_back += 1);
                self.emit(SyncEvent::MutationFailed {
                    entity_id: id,
                    mutation: MutationKind::Create,
                    error: error.clone(),
                });
                self.publish(&state);
                Err(error)
            }
        }
    }

    async fn load_root(&self, post_id: &str) -> Result<Entity, SyncError> {
        let epoch = self.state.lock().epoch;
        let result = self.backend.fetch_one(EntityKind::Post, post_id).await;

        let mut state = self.state.lock();
        if state.epoch != epoch {
            self.stats.update(|s| s.responses_discarded += 1);
            return Err(SyncError::Closed);
        }
        let entity = result?;
        let scope = Scope::Post(post_id.to_string());
        let was_deleted = state.root_post.get(post_id).is_some_and(Entity::is_deleted);
        match apply_event(&mut state.root_post, EntityKind::Post, RealtimeEvent::Upsert(entity)) {
            Applied::Rejected(error) => return Err(error),
            Applied::Changed => {
                if !was_deleted && state.root_post.get(post_id).is_some_and(Entity::is_deleted) {
                    self.emit(SyncEvent::RootDeleted { scope });
                }
                self.publish(&state);
            }
            Applied::Unchanged => {}
        }
        state
            .root_post
            .get(post_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound {
                id: post_id.to_string(),
            })
    }

    async fn refresh(&self, entity_id: &str) -> Result<(), SyncError> {
        let (kind, epoch) = {
            let state = self.state.lock();
            (Engine::entity_kind(&state)?, state.epoch)
        };

        let result = self.backend.fetch_one(kind, entity_id).await;

        let mut state = self.state.lock();
        if state.epoch != epoch {
            self.stats.update(|s| s.responses_discarded += 1);
            return Err(SyncError::Closed);
        }
        let entity = result?;
        if apply_event(&mut state.store, kind, RealtimeEvent::Upsert(entity)).changed() {
            self.publish(&state);
        }
        Ok(())
    }
}

enum Resubscribe {
    Restored(mpsc::UnboundedReceiver<RealtimeEvent>),
    Failed,
    Gone,
}

/// Drain the realtime channel of one scope session. Holds only a weak
/// reference between events so that dropping every `Collection` handle
/// tears the session down.
async fn pump(
    engine: Weak<Engine>,
    scope: Scope,
    session: u64,
    mut receiver: Option<mpsc::UnboundedReceiver<RealtimeEvent>>,
) {
    let mut attempt = 0u32;
    loop {
        let mut rx = match receiver.take() {
            Some(rx) => rx,
            None => {
                attempt += 1;
                let Some(strong) = engine.upgrade() else {
                    return;
                };
                if attempt > strong.config.max_resubscribe_attempts {
                    strong.subscription_failed(&scope, session);
                    return;
                }
                let delay = strong.config.resubscribe_delay(attempt);
                drop(strong);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let Some(strong) = engine.upgrade() else {
                    return;
                };
                match strong.resubscribe(&scope, session, attempt) {
                    Resubscribe::Restored(rx) => {
                        attempt = 0;
                        receiver = Some(rx);
                        strong.catch_up(&scope, session).await;
                    }
                    Resubscribe::Failed => {}
                    Resubscribe::Gone => return,
                }
                continue;
            }
        };

        let reason = loop {
            match rx.recv().await {
                Some(RealtimeEvent::Lost { reason }) => break reason,
                Some(event) => {
                    let Some(strong) = engine.upgrade() else {
                        return;
                    };
                    if !strong.apply_realtime(&scope, session, event) {
                        return;
                    }
                }
                None => break "event channel closed".to_string(),
            }
        };

        let Some(strong) = engine.upgrade() else {
            return;
        };
        if !strong.subscription_lost(&scope, session, &reason) {
            return;
        }
    }
}

fn targets(event: &RealtimeEvent, id: &str) -> bool {
    match event {
        RealtimeEvent::Upsert(entity) => entity.id == id,
        RealtimeEvent::Remove { id: removed } => removed == id,
        RealtimeEvent::Lost { .. } => false,
    }
}

/// Whether an entity belongs to the initial window of `scope`.
fn in_window(
    layout: CollectionLayout,
    scope: &Scope,
    root_id: &str,
    parent_id: Option<&str>,
) -> bool {
    match (layout, scope) {
        (CollectionLayout::List, _) => true,
        (CollectionLayout::Tree, Scope::Comment(_)) => parent_id == Some(root_id),
        (CollectionLayout::Tree, _) => parent_id.is_none() || parent_id == Some(root_id),
    }
}

/// Mutations only target entities the server knows and the user can see.
fn confirmed_entity<'a>(state: &'a State, entity_id: &str) -> Result<&'a Entity, SyncError> {
    let record = state
        .store
        .record(entity_id)
        .filter(|r| r.is_visible())
        .ok_or_else(|| SyncError::NotFound {
            id: entity_id.to_string(),
        })?;
    if record.entity.pending {
        return Err(SyncError::validation(format!(
            "{} is not confirmed yet",
            entity_id
        )));
    }
    Ok(&record.entity)
}
