pub mod entity;
pub mod page;
pub mod scope;

pub use entity::{Entity, EntityKind, Payload, SequenceKey};
pub use page::{Cursor, Page, PageDirection, PageRequest};
pub use scope::Scope;
