//! Camera stream lifecycle
//!
//! # Components
//!
//! - `StreamLifecycleController` - per-camera state machine driving the transcoder
//! - `StreamState` / `CameraStreamInfo` - states and snapshots reported to clients

pub mod controller;
pub mod types;

pub use controller::StreamLifecycleController;
pub use types::{CameraStreamInfo, ControllerStats, FailureKind, StreamFailure, StreamState};
