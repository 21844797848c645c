//! Session state and per-session bookkeeping

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::signalling::IceCandidate;
use crate::webrtc::DataChannelTopology;

/// Encoder QP when the streamer has not reported one
pub const UNKNOWN_QP: i32 = -1;

/// Controller state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    SignallingConnecting,
    AwaitingStreamerList,
    Negotiating,
    Connected,
    Disconnected { terminal: bool, reason: String },
    Reconnecting,
}

impl SessionState {
    /// A new `connect` is accepted from here
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected { terminal: true, .. })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::SignallingConnecting => write!(f, "signalling_connecting"),
            Self::AwaitingStreamerList => write!(f, "awaiting_streamer_list"),
            Self::Negotiating => write!(f, "negotiating"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected { terminal: true, .. } => write!(f, "disconnected"),
            Self::Disconnected { terminal: false, .. } => write!(f, "disconnected_recoverable"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// One offer/answer cycle
#[derive(Debug, Clone, Default)]
pub struct NegotiationContext {
    /// Remote description after stripping
    pub remote_sdp: Option<String>,
    /// Codec intersection
    pub codecs: Vec<String>,
    pub use_mic: bool,
    /// Local description has been applied
    pub committed: bool,
    /// Remote description has been applied
    pub remote_applied: bool,
}

/// Per-session values owned by the controller
#[derive(Debug, Clone)]
pub struct SessionData {
    /// Sticky across reconnects
    pub subscribed_streamer_id: Option<String>,
    /// Subscribe was sent and no disconnect happened since
    pub subscription_active: bool,
    pub reconnect_attempt: u32,
    pub auto_join_attempt: u32,
    pub is_using_sfu: bool,
    pub is_using_svc: bool,
    /// Preferred codec was re-selected from stats in this session
    pub codec_reselected: bool,
    /// Stats may update the preferred codec
    pub auto_update_codec: bool,
    pub generation: u64,
    pub avg_qp: i32,
    pub enable_auto_reconnect: bool,
    pub force_reconnect: bool,
    pub locally_closed: bool,
    /// Overrides the close reason in the next disconnect
    pub disconnect_message: Option<String>,
    /// A signalling close for this generation has not been handled yet
    pub signalling_live: bool,
    pub negotiation: Option<NegotiationContext>,
    /// Remote candidates received before the remote description was applied
    pub pending_candidates: Vec<IceCandidate>,
    pub ice_established: bool,
    pub connected_emitted: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub controls_stream_input: Option<bool>,
    pub topology: DataChannelTopology,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            subscribed_streamer_id: None,
            subscription_active: false,
            reconnect_attempt: 0,
            auto_join_attempt: 0,
            is_using_sfu: false,
            is_using_svc: false,
            codec_reselected: false,
            auto_update_codec: true,
            generation: 0,
            avg_qp: UNKNOWN_QP,
            enable_auto_reconnect: true,
            force_reconnect: false,
            locally_closed: false,
            disconnect_message: None,
            signalling_live: false,
            negotiation: None,
            pending_candidates: Vec::new(),
            ice_established: false,
            connected_emitted: false,
            connected_at: None,
            controls_stream_input: None,
            topology: DataChannelTopology::Direct,
        }
    }
}

impl SessionData {
    /// Forget everything tied to the current peer connection
    pub fn reset_media(&mut self) {
        self.negotiation = None;
        self.pending_candidates.clear();
        self.ice_established = false;
        self.connected_emitted = false;
        self.connected_at = None;
        self.controls_stream_input = None;
        self.topology = DataChannelTopology::Direct;
        self.avg_qp = UNKNOWN_QP;
    }

    /// Negotiation in progress whose local description is not applied yet
    pub fn negotiation_pending(&self) -> bool {
        self.negotiation.as_ref().is_some_and(|n| !n.committed)
    }

    /// Remote candidates can be applied right away
    pub fn remote_applied(&self) -> bool {
        self.negotiation.as_ref().is_some_and(|n| n.remote_applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        let state = SessionState::Disconnected {
            terminal: false,
            reason: "x".to_string(),
        };
        assert_eq!(state.to_string(), "disconnected_recoverable");
        assert!(state.can_connect());
        assert!(!state.is_terminal());
        assert!(!SessionState::Connected.can_connect());
    }

    #[test]
    fn test_reset_media_keeps_subscription() {
        let mut data = SessionData {
            subscribed_streamer_id: Some("A".to_string()),
            avg_qp: 30,
            connected_emitted: true,
            negotiation: Some(NegotiationContext::default()),
            ..Default::default()
        };
        assert!(data.negotiation_pending());

        data.reset_media();
        assert_eq!(data.subscribed_streamer_id.as_deref(), Some("A"));
        assert_eq!(data.avg_qp, UNKNOWN_QP);
        assert!(!data.connected_emitted);
        assert!(!data.negotiation_pending());
    }
}
