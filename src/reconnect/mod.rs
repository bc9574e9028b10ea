//! Viewer reconnection
//!
//! A dropped session is re-negotiated with capped exponential backoff until
//! it connects again or runs out of retries. The retry timer is tied to the
//! session's cancellation token, so unregistering a viewer stops any pending
//! attempt.

pub mod supervisor;

pub use supervisor::{PeerTransport, ReconnectPlan, ReconnectionSupervisor};
