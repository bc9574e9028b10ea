//! Configuration
//!
//! Typed application configuration persisted as JSON in SQLite.

mod schema;
mod store;

pub use schema::{
    AppConfig, CameraConfig, EventsConfig, LifecycleConfig, ReconnectConfig, RelayConfig,
    SessionConfig, TranscodeConfig, WebConfig,
};
pub use store::{ConfigChange, ConfigStore};
