pub mod backend;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod memory;
pub mod models;
pub mod runtime;
pub mod stats;
pub mod store;

// Re-export the engine surface at crate root for convenience
pub use backend::{EventSink, RealtimeEvent, Subscription, SyncBackend, ToggleOp};
pub use config::{CollectionLayout, Session, SyncConfig};
pub use error::SyncError;
pub use events::SyncEvent;
pub use models::{Entity, EntityKind, Payload, Scope, SequenceKey};
pub use runtime::{Collection, Draft, LoadOutcome, SubscriptionStatus};
