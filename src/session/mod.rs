//! Viewer sessions and reference counting

pub mod registry;
pub mod types;

pub use registry::SessionRegistry;
pub use types::{CloseReason, Registration, SessionState, ViewerSessionInfo};
