pub mod config;
pub mod fixture;
pub mod logging;
pub mod render;
pub mod replay;

pub use config::{default_config_path, resolve_config};
pub use fixture::{Fixture, FixtureEvent};
pub use logging::init_tracing;
pub use render::{render_json, render_text};
pub use replay::{replay, ReplayOptions, ReplayReport};
