use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use livesync_core::memory::MemoryBackend;
use livesync_core::{Entity, RealtimeEvent, Scope};
use serde::Deserialize;

/// Replay input: backend contents per scope plus realtime events pushed
/// after the pages are loaded.
///
/// ```json
/// {
///   "userId": "alice",
///   "entities": { "channel:general": [{ "id": "m1", "kind": "message", "sequenceKey": 1 }] },
///   "events": [{ "type": "remove", "id": "m1" }]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    /// Viewer identity; decides which entities render as own
    #[serde(default)]
    pub user_id: Option<String>,
    /// Keyed by `kind:id` scope text
    #[serde(default)]
    pub entities: BTreeMap<String, Vec<Entity>>,
    #[serde(default)]
    pub events: Vec<FixtureEvent>,
}

/// A realtime event; without `scope` it goes to the opened scope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FixtureEvent {
    Upsert {
        #[serde(default)]
        scope: Option<String>,
        entity: Entity,
    },
    Remove {
        #[serde(default)]
        scope: Option<String>,
        id: String,
    },
}

impl FixtureEvent {
    pub fn resolve(&self, default_scope: &Scope) -> Result<(Scope, RealtimeEvent)> {
        let (scope, event) = match self {
            FixtureEvent::Upsert { scope, entity } => {
                (scope, RealtimeEvent::Upsert(entity.clone()))
            }
            FixtureEvent::Remove { scope, id } => (scope, RealtimeEvent::Remove { id: id.clone() }),
        };
        let scope = match scope {
            Some(text) => parse_scope(text)?,
            None => default_scope.clone(),
        };
        Ok((scope, event))
    }
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse fixture: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid fixture JSON")
    }

    /// Copy every scope's entities into `backend`.
    pub fn seed(&self, backend: &MemoryBackend) -> Result<usize> {
        let mut seeded = 0;
        for (scope, entities) in &self.entities {
            let scope = parse_scope(scope)?;
            seeded += entities.len();
            backend.seed(scope, entities.iter().cloned());
        }
        Ok(seeded)
    }
}

fn parse_scope(text: &str) -> Result<Scope> {
    text.parse::<Scope>()
        .with_context(|| format!("Invalid scope in fixture: {:?}", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use livesync_core::models::PageRequest;
    use livesync_core::SyncBackend;
    use std::io::Write;

    const FIXTURE: &str = r#"{
        "userId": "alice",
        "entities": {
            "channel:general": [
                {"id": "m1", "kind": "message", "sequenceKey": 1, "payload": {"text": "hi"}},
                {"id": "m2", "kind": "message", "sequenceKey": 2}
            ]
        },
        "events": [
            {"type": "upsert", "entity": {"id": "m3", "kind": "message", "sequenceKey": 3}},
            {"type": "remove", "scope": "channel:general", "id": "m1"}
        ]
    }"#;

    #[test]
    fn test_parse_fixture() {
        let fixture = Fixture::from_json(FIXTURE).unwrap();
        assert_eq!(fixture.user_id.as_deref(), Some("alice"));
        assert_eq!(fixture.entities["channel:general"].len(), 2);
        assert_eq!(fixture.events.len(), 2);
    }

    #[test]
    fn test_event_defaults_to_open_scope() {
        let fixture = Fixture::from_json(FIXTURE).unwrap();
        let open = Scope::Channel("other".to_string());

        let (scope, event) = fixture.events[0].resolve(&open).unwrap();
        assert_eq!(scope, open);
        assert!(matches!(event, RealtimeEvent::Upsert(e) if e.id == "m3"));

        let (scope, _) = fixture.events[1].resolve(&open).unwrap();
        assert_eq!(scope, Scope::Channel("general".to_string()));
    }

    #[test]
    fn test_bad_scope_key_is_reported() {
        let fixture = Fixture::from_json(r#"{"entities": {"nowhere": []}}"#).unwrap();
        let err = fixture.seed(&MemoryBackend::new()).unwrap_err();
        assert!(err.to_string().contains("Invalid scope in fixture"));
    }

    #[tokio::test]
    async fn test_load_and_seed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FIXTURE.as_bytes()).unwrap();

        let fixture = Fixture::load(file.path()).unwrap();
        let backend = MemoryBackend::new();
        assert_eq!(fixture.seed(&backend).unwrap(), 2);

        let page = backend
            .query_page(&Scope::Channel("general".to_string()), PageRequest::initial(10))
            .await
            .unwrap();
        assert_eq!(page.entities.len(), 2);
    }
}
