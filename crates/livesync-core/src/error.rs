/// Failures surfaced by the sync engine.
///
/// Every asynchronous failure resolves into one of these values and is stored
/// as collection state or emitted as a `SyncEvent`; nothing here is meant to
/// unwind past the collection boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Query or mutation failed in transit; retryable by explicit user action
    #[error("Network error: {message}")]
    TransientNetwork { message: String },
    /// Malformed scope id or missing required field; fatal to the operation
    #[error("Validation error: {message}")]
    Validation { message: String },
    /// Realtime channel dropped
    #[error("Subscription lost for {scope}: {reason}")]
    SubscriptionLost { scope: String, reason: String },
    /// The backend refused a mutation
    #[error("Rejected by server: {message}")]
    Rejected { message: String },
    #[error("Entity not found: {id}")]
    NotFound { id: String },
    /// The collection was closed (or moved to another scope) while the operation was in flight
    #[error("Collection closed")]
    Closed,
}

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        SyncError::TransientNetwork {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::Validation {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        SyncError::Rejected {
            message: message.into(),
        }
    }

    /// Whether a user-triggered retry (pull to refresh, retry tap) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork { .. } | SyncError::SubscriptionLost { .. }
        )
    }
}
