use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use livesync_core::memory::MemoryBackend;
use livesync_core::models::PageDirection;
use livesync_core::runtime::LoadOutcome;
use livesync_core::stats::SyncStats;
use livesync_core::store::{ViewItem, ViewNode};
use livesync_core::{Collection, CollectionLayout, Scope, Session, SyncConfig, SyncEvent};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::fixture::Fixture;

const EVENT_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub scope: Scope,
    /// Older pages to load after the initial window
    pub pages: usize,
    /// Open every top-level comment's reply thread (post scopes only)
    pub expand_all: bool,
}

/// Final projection of a replay
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub scope: String,
    pub layout: CollectionLayout,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ViewItem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<ViewNode>,
    /// Failures the engine reported along the way
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub stats: SyncStats,
}

/// Seed an in-memory backend from `fixture`, drive a collection through
/// open, initial load, older pages and the fixture's realtime events, and
/// return what the UI would render.
pub async fn replay(
    fixture: &Fixture,
    config: SyncConfig,
    options: &ReplayOptions,
) -> Result<ReplayReport> {
    let backend = MemoryBackend::new();
    let seeded = fixture.seed(&backend)?;
    debug!(seeded, "backend seeded");

    let layout = match options.scope {
        Scope::Post(_) => CollectionLayout::Tree,
        _ => CollectionLayout::List,
    };
    let session = Session::new(fixture.user_id.clone().unwrap_or_default());
    let (collection, mut events) =
        Collection::new(Arc::new(backend.clone()), config, session, layout);

    collection
        .open(options.scope.clone())
        .with_context(|| format!("Failed to open {}", options.scope))?;
    log_outcome("initial page", collection.load_initial().await?);

    for page in 0..options.pages {
        match collection.load_more(PageDirection::Before).await? {
            LoadOutcome::Skipped => {
                debug!(page, "no older pages");
                break;
            }
            outcome => log_outcome("older page", outcome),
        }
    }

    if options.expand_all && layout == CollectionLayout::Tree {
        let top_level: Vec<String> = collection
            .tree()
            .iter()
            .map(|node| node.id().to_string())
            .collect();
        for id in top_level {
            log_outcome("replies", collection.expand(&id).await?);
        }
    }

    let mut delivered = 0;
    for event in &fixture.events {
        let (scope, event) = event.resolve(&options.scope)?;
        delivered += backend.push(&scope, event);
    }
    wait_for_events(&collection, delivered).await?;

    let mut warnings = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::PageFailed { scope, error } => {
                warnings.push(format!("page load failed for {}: {}", scope, error))
            }
            SyncEvent::SubscriptionFailed { scope, error } => {
                warnings.push(format!("live updates stopped for {}: {}", scope, error))
            }
            SyncEvent::RootDeleted { scope } => {
                warnings.push(format!("root post of {} was deleted", scope))
            }
            _ => {}
        }
    }

    let report = ReplayReport {
        scope: options.scope.to_string(),
        layout,
        items: match layout {
            CollectionLayout::List => collection.view(),
            CollectionLayout::Tree => Vec::new(),
        },
        nodes: match layout {
            CollectionLayout::List => Vec::new(),
            CollectionLayout::Tree => collection.tree(),
        },
        warnings,
        stats: collection.stats(),
    };
    collection.close();
    info!(
        scope = %report.scope,
        applied = report.stats.events_applied,
        ignored = report.stats.events_ignored,
        "replay finished"
    );
    Ok(report)
}

fn log_outcome(what: &str, outcome: LoadOutcome) {
    match outcome {
        LoadOutcome::Loaded { count } => debug!(count, "{} loaded", what),
        LoadOutcome::Failed(error) => warn!("{} failed: {}", what, error),
        LoadOutcome::Skipped | LoadOutcome::Discarded => debug!("{} not loaded", what),
    }
}

/// Realtime events are applied on the subscription task; wait until each
/// delivered event has been counted.
async fn wait_for_events(collection: &Collection, delivered: usize) -> Result<()> {
    let settled = async {
        loop {
            let stats = collection.stats();
            let processed = stats.events_applied + stats.events_ignored + stats.events_rejected;
            if processed >= delivered as u64 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(EVENT_SETTLE_TIMEOUT, settled).await.is_err() {
        bail!("Timed out waiting for {} realtime events", delivered);
    }
    Ok(())
}
