//! pixelstream - pixel streaming client session controller
//!
//! This crate negotiates a media session with a remote streamer through a
//! signalling relay: streamer discovery, offer/answer munging, candidate
//! filtering, reconnects and per-second statistics.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod signalling;
pub mod stats;
pub mod utils;
pub mod webrtc;

pub use controller::{SessionController, SessionHandle, SessionState};
pub use error::{AppError, Result};
