//! Session event types
//!
//! Serialized as
//! ```json
//! { "event": "streamer.list", "data": { "streamers": ["a", "b"], ... } }
//! ```

use serde::Serialize;

use crate::stats::{LatencyBreakdown, StatsView};

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------
    /// Controller state changed
    #[serde(rename = "session.state_changed")]
    StateChanged { state: String },

    /// About to open the signalling connection
    #[serde(rename = "signalling.connecting")]
    SignallingConnecting { url: String },

    /// A connection attempt started without a host request (retry or manual reconnect)
    #[serde(rename = "signalling.auto_connect")]
    AutoConnect,

    #[serde(rename = "signalling.connected")]
    SignallingConnected,

    /// Session ended
    #[serde(rename = "session.disconnected")]
    Disconnected {
        reason: String,
        /// False while an automatic retry is pending
        allow_manual_reconnect: bool,
    },

    // ------------------------------------------------------------------
    // Streamer discovery
    // ------------------------------------------------------------------
    #[serde(rename = "streamer.list")]
    StreamerList {
        streamers: Vec<String>,
        auto_selected: Option<String>,
        wanted: Option<String>,
    },

    /// Gave up waiting for the wanted streamer to appear
    #[serde(rename = "streamer.auto_select_failed")]
    StreamerAutoSelectFailed,

    #[serde(rename = "streamer.id_changed")]
    StreamerIdChanged { new_id: String },

    #[serde(rename = "streamer.subscribe_failed")]
    SubscribeFailed { message: String },

    #[serde(rename = "streamer.player_count")]
    PlayerCount { count: u32 },

    // ------------------------------------------------------------------
    // Media negotiation
    // ------------------------------------------------------------------
    #[serde(rename = "webrtc.sdp_offer")]
    SdpOffer { sdp: String },

    #[serde(rename = "webrtc.sdp_answer")]
    SdpAnswer { sdp: String },

    #[serde(rename = "webrtc.connecting")]
    WebRtcConnecting,

    /// Media path established (emitted once per session)
    #[serde(rename = "webrtc.connected")]
    Connected,

    #[serde(rename = "webrtc.failed")]
    WebRtcFailed,

    #[serde(rename = "datachannel.open")]
    DataChannelOpen { label: String },

    #[serde(rename = "datachannel.close")]
    DataChannelClose { label: String },

    // ------------------------------------------------------------------
    // Streamer messages
    // ------------------------------------------------------------------
    #[serde(rename = "stream.video_encoder_avg_qp")]
    VideoEncoderAvgQp { qp: i32 },

    #[serde(rename = "stream.initial_settings")]
    InitialSettings { settings: serde_json::Value },

    /// Any other data-channel message from the streamer
    #[serde(rename = "stream.message")]
    StreamerMessage { name: String, payload: String },

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------
    #[serde(rename = "stats.tick")]
    StatsTick { stats: Box<StatsView> },

    #[serde(rename = "stats.latency")]
    LatencyCalculated { latency: LatencyBreakdown },

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------
    #[serde(rename = "settings.changed")]
    SettingsChanged { key: String, value: String },

    #[serde(rename = "error")]
    Error { message: String },
}

impl SessionEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "session.state_changed",
            Self::SignallingConnecting { .. } => "signalling.connecting",
            Self::AutoConnect => "signalling.auto_connect",
            Self::SignallingConnected => "signalling.connected",
            Self::Disconnected { .. } => "session.disconnected",
            Self::StreamerList { .. } => "streamer.list",
            Self::StreamerAutoSelectFailed => "streamer.auto_select_failed",
            Self::StreamerIdChanged { .. } => "streamer.id_changed",
            Self::SubscribeFailed { .. } => "streamer.subscribe_failed",
            Self::PlayerCount { .. } => "streamer.player_count",
            Self::SdpOffer { .. } => "webrtc.sdp_offer",
            Self::SdpAnswer { .. } => "webrtc.sdp_answer",
            Self::WebRtcConnecting => "webrtc.connecting",
            Self::Connected => "webrtc.connected",
            Self::WebRtcFailed => "webrtc.failed",
            Self::DataChannelOpen { .. } => "datachannel.open",
            Self::DataChannelClose { .. } => "datachannel.close",
            Self::VideoEncoderAvgQp { .. } => "stream.video_encoder_avg_qp",
            Self::InitialSettings { .. } => "stream.initial_settings",
            Self::StreamerMessage { .. } => "stream.message",
            Self::StatsTick { .. } => "stats.tick",
            Self::LatencyCalculated { .. } => "stats.latency",
            Self::SettingsChanged { .. } => "settings.changed",
            Self::Error { .. } => "error",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// `*` matches everything, `streamer.*` a whole group.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        match topic.strip_suffix(".*") {
            Some(prefix) => event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => event_name == topic,
        }
    }
}
