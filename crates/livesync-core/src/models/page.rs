use crate::models::Entity;
use serde::{Deserialize, Serialize};

/// Opaque pagination token handed out by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Cursor(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `Before` walks toward older entities, `After` toward newer ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PageDirection {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// None for the initial window
    pub cursor: Option<Cursor>,
    pub direction: PageDirection,
    pub limit: usize,
}

impl PageRequest {
    pub fn initial(limit: usize) -> Self {
        Self {
            cursor: None,
            direction: PageDirection::Before,
            limit,
        }
    }
}

/// One page of a query. A `None` cursor means that direction is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub before: Option<Cursor>,
    #[serde(default)]
    pub after: Option<Cursor>,
}
