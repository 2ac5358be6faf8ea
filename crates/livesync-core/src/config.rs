use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAX_RESUBSCRIBE_ATTEMPTS, DEFAULT_PAGE_SIZE, DEFAULT_RESUBSCRIBE_BACKOFF_MS,
};

/// Display order of a projected collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    /// Oldest first (comment threads)
    Ascending,
    /// Newest first (chat, rendered bottom-up)
    Descending,
}

/// Whether the projection is a flat list or a comment tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionLayout {
    List,
    Tree,
}

/// Engine tuning that can be loaded from a JSON file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub page_size: usize,
    pub max_resubscribe_attempts: u32,
    pub resubscribe_backoff_ms: u64,
    /// Overrides the layout default (descending for lists, ascending for trees)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_resubscribe_attempts: DEFAULT_MAX_RESUBSCRIBE_ATTEMPTS,
            resubscribe_backoff_ms: DEFAULT_RESUBSCRIBE_BACKOFF_MS,
            order: None,
        }
    }
}

impl SyncConfig {
    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: SyncConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        anyhow::ensure!(config.page_size > 0, "pageSize must be at least 1");
        Ok(config)
    }

    pub fn order_for(&self, layout: CollectionLayout) -> SortOrder {
        self.order.unwrap_or(match layout {
            CollectionLayout::List => SortOrder::Descending,
            CollectionLayout::Tree => SortOrder::Ascending,
        })
    }

    pub fn resubscribe_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Viewer identity, passed explicitly instead of looked up from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Session {
    pub user_id: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_fields_missing() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.page_size, 10);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"pageSize": 25, "order": "ascending"}}"#).unwrap();

        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config.page_size, 25);
        assert_eq!(config.order_for(CollectionLayout::List), SortOrder::Ascending);
        assert_eq!(config.max_resubscribe_attempts, DEFAULT_MAX_RESUBSCRIBE_ATTEMPTS);
    }

    #[test]
    fn test_load_rejects_zero_page_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"pageSize": 0}}"#).unwrap();
        assert!(SyncConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_layout_default_order() {
        let config = SyncConfig::default();
        assert_eq!(config.order_for(CollectionLayout::List), SortOrder::Descending);
        assert_eq!(config.order_for(CollectionLayout::Tree), SortOrder::Ascending);
        assert_eq!(config.resubscribe_delay(3), Duration::from_millis(750));
    }
}
