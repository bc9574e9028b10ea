//! Offer/answer negotiation between viewers and the media relay

pub mod exchange;
pub mod sdp;

pub use exchange::SignalingExchange;
pub use sdp::{SdpAnswer, SdpOffer};
