//! Utility modules shared by the coordinator and the server

pub mod backoff;
pub mod net;
pub mod throttle;

pub use backoff::BackoffPolicy;
pub use net::bind_tcp_listener;
pub use throttle::LogThrottler;
