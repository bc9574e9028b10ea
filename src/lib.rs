//! sentinel-live - live video session coordinator
//!
//! This crate sits between browser viewers and a WHEP media relay. It keeps
//! one upstream transcode per camera alive while viewers watch, negotiates
//! viewer sessions against the relay and brings dropped viewers back with
//! capped exponential backoff.

pub mod config;
pub mod error;
pub mod events;
pub mod reconnect;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod state;
pub mod stream;
pub mod transcode;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
