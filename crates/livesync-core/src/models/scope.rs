use crate::error::SyncError;
use crate::models::EntityKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a live collection: what the realtime subscription and
/// page queries are keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum Scope {
    /// Messages of a chat channel
    Channel(String),
    /// Top-level comments of a post
    Post(String),
    /// Replies to a comment
    Comment(String),
    /// Posts of a feed/community
    Feed(String),
}

impl Scope {
    pub fn id(&self) -> &str {
        match self {
            Scope::Channel(id) | Scope::Post(id) | Scope::Comment(id) | Scope::Feed(id) => id,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Scope::Channel(_) => "channel",
            Scope::Post(_) => "post",
            Scope::Comment(_) => "comment",
            Scope::Feed(_) => "feed",
        }
    }

    /// Kind of the entities this scope holds
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Scope::Channel(_) => EntityKind::Message,
            Scope::Post(_) | Scope::Comment(_) => EntityKind::Comment,
            Scope::Feed(_) => EntityKind::Post,
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let id = self.id();
        if id.is_empty() {
            return Err(SyncError::validation(format!("empty {} scope id", self.prefix())));
        }
        if id.trim() != id || id.contains(char::is_control) {
            return Err(SyncError::validation(format!(
                "malformed {} scope id: {:?}",
                self.prefix(),
                id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix(), self.id())
    }
}

impl FromStr for Scope {
    type Err = SyncError;

    /// Parse `kind:id`, e.g. `channel:general` or `post:abc123`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s
            .split_once(':')
            .ok_or_else(|| SyncError::validation(format!("scope must be kind:id, got {:?}", s)))?;
        let id = id.to_string();
        let scope = match prefix {
            "channel" => Scope::Channel(id),
            "post" => Scope::Post(id),
            "comment" => Scope::Comment(id),
            "feed" => Scope::Feed(id),
            other => {
                return Err(SyncError::validation(format!(
                    "unknown scope kind: {}",
                    other
                )))
            }
        };
        scope.validate()?;
        Ok(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scope() {
        let scope: Scope = "channel:general".parse().unwrap();
        assert_eq!(scope, Scope::Channel("general".to_string()));
        assert_eq!(scope.to_string(), "channel:general");
        assert_eq!(scope.entity_kind(), EntityKind::Message);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("general".parse::<Scope>().is_err());
        assert!("thread:abc".parse::<Scope>().is_err());
        assert!("post:".parse::<Scope>().is_err());
        assert!("post: abc".parse::<Scope>().is_err());
    }

    #[test]
    fn test_validate_empty_id() {
        let err = Scope::Comment(String::new()).validate().unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }
}
