//! Session orchestration
//!
//! [`SessionController`] drives the whole client session: signalling,
//! streamer selection, negotiation, reconnects and stats. Hosts talk to it
//! through a [`SessionHandle`].
//!
//! ```text
//! Idle -> SignallingConnecting -> AwaitingStreamerList -> Negotiating -> Connected
//!              ^                                                            |
//!              +------ Reconnecting <------ Disconnected (recoverable) <----+
//! ```

pub mod inputs;
pub mod reconnect;
pub mod selection;
pub mod session;
pub mod state;


pub use inputs::{InputBinding, InputBindings, InputKind};
pub use selection::StreamerCatalog;
pub use session::{Command, SessionController, SessionHandle, STATS_INTERVAL};
pub use state::{SessionState, UNKNOWN_QP};
