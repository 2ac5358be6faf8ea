pub mod entity_store;
pub mod optimistic;
pub mod pagination;
pub mod reducer;
pub mod views;

pub use entity_store::{EntityStore, Record};
pub use optimistic::{
    Attribute, EditTicket, MutationLayer, RequestId, Resolution, ToggleState, ToggleTicket,
};
pub use pagination::PageState;
pub use reducer::{apply_event, apply_page, Applied};
pub use views::{Projection, ViewItem, ViewNode};
