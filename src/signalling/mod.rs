//! Signalling session
//!
//! JSON control messages over a WebSocket relay:
//! - `messages`: typed inbound/outbound wire messages
//! - `transport`: connector/transport traits and the tokio-tungstenite implementation
//! - `keepalive`: ping/pong liveness monitor

pub mod keepalive;
pub mod messages;
pub mod transport;

pub use keepalive::KeepaliveMonitor;
pub use messages::{
    IceCandidate, IceServer, IceUrls, InboundMessage, OutboundMessage, PeerConnectionOptions,
    SessionDescriptionMessage,
};
pub use transport::{
    SignallingConnector, SignallingTransport, TransportEvent, WebSocketConnector,
    CLOSE_GOING_AWAY, CLOSE_NORMAL,
};
