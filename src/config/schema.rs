use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Lower bound for the streamer re-query interval
pub const MIN_AUTO_JOIN_INTERVAL_MS: u64 = 500;
/// Upper bound for the reconnect attempt budget
pub const MAX_RECONNECT_ATTEMPTS_LIMIT: u32 = 999;

/// Main client configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Signalling connection settings
    pub signalling: SignallingConfig,
    /// Streamer discovery and reconnect policy
    pub streamer: StreamerConfig,
    /// Media negotiation settings
    pub webrtc: WebRtcConfig,
    /// Which input bindings are enabled once connected
    pub input: InputConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            signalling: SignallingConfig::default(),
            streamer: StreamerConfig::default(),
            webrtc: WebRtcConfig::default(),
            input: InputConfig::default(),
        }
    }
}

/// Signalling connection configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignallingConfig {
    /// Signalling server URL (ws:// or wss://)
    pub url: String,
    /// WebSocket sub-protocols requested on connect
    pub subprotocols: Vec<String>,
    /// Interval between keepalive pings, 0 disables the monitor
    pub keepalive_delay_ms: u64,
    /// Whether URL query parameters may override settings
    pub use_url_params: bool,
}

impl Default for SignallingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:80".to_string(),
            subprotocols: vec![],
            keepalive_delay_ms: 30_000,
            use_url_params: true,
        }
    }
}

/// Streamer discovery and reconnect policy
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamerConfig {
    /// Streamer id pinned by the host; takes priority over the last subscribed id
    pub streamer_id: Option<String>,
    /// Keep polling the streamer list until the wanted streamer shows up
    pub wait_for_streamer: bool,
    /// Delay between streamer list re-queries
    pub auto_join_interval_ms: u64,
    /// Budget for both reconnect cycles and streamer re-queries
    pub max_reconnect_attempts: u32,
    /// Connect as soon as the controller starts
    pub auto_connect: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            streamer_id: None,
            wait_for_streamer: true,
            auto_join_interval_ms: 3000,
            max_reconnect_attempts: 3,
            auto_connect: false,
        }
    }
}

impl StreamerConfig {
    /// Clamp numeric fields into their accepted ranges
    pub fn normalize(&mut self) {
        self.auto_join_interval_ms = self.auto_join_interval_ms.max(MIN_AUTO_JOIN_INTERVAL_MS);
        self.max_reconnect_attempts = self.max_reconnect_attempts.min(MAX_RECONNECT_ATTEMPTS_LIMIT);
    }
}

/// Media negotiation configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebRtcConfig {
    /// Only relay candidates are admitted
    pub force_turn: bool,
    /// Ask the streamer for mono audio
    pub force_mono_audio: bool,
    /// Send microphone audio to the streamer
    pub use_mic: bool,
    /// Send camera video to the streamer
    pub use_camera: bool,
    /// Add the abs-capture-time header extension to local descriptions
    pub enable_capture_time_ext: bool,
    /// Minimum bitrate hint sent with offers/answers (kbps)
    pub min_bitrate_kbps: u32,
    /// Maximum bitrate hint sent with offers/answers (kbps)
    pub max_bitrate_kbps: u32,
    /// Create the offer locally instead of waiting for the streamer's
    pub offer_to_receive: bool,
    /// Preferred video codec and its current option list
    pub preferred_codec: CodecPreference,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            force_turn: false,
            force_mono_audio: false,
            use_mic: false,
            use_camera: false,
            enable_capture_time_ext: false,
            min_bitrate_kbps: 0,
            max_bitrate_kbps: 0,
            offer_to_receive: false,
            preferred_codec: CodecPreference::default(),
        }
    }
}

/// Selected codec plus the options it was chosen from
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CodecPreference {
    /// Selected entry, empty when nothing is preferred
    pub selected: String,
    /// Codec strings offered to the user ("NAME k=v;k=v")
    pub options: Vec<String>,
}

impl CodecPreference {
    /// Replace the option list, keeping the selection if it is still offered
    pub fn set_options(&mut self, options: Vec<String>) {
        if !options.iter().any(|o| o == &self.selected) {
            self.selected = options.first().cloned().unwrap_or_default();
        }
        self.options = options;
    }
}

/// Input binding toggles
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InputConfig {
    pub keyboard: bool,
    pub mouse: bool,
    pub touch: bool,
    pub gamepad: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            keyboard: true,
            mouse: true,
            touch: true,
            gamepad: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_player_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.streamer.max_reconnect_attempts, 3);
        assert_eq!(config.streamer.auto_join_interval_ms, 3000);
        assert!(config.streamer.wait_for_streamer);
        assert_eq!(config.signalling.keepalive_delay_ms, 30_000);
        assert!(!config.webrtc.force_turn);
        assert!(!config.webrtc.enable_capture_time_ext);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"webrtc": {"force_turn": true}}"#).unwrap();
        assert!(config.webrtc.force_turn);
        assert_eq!(config.streamer.max_reconnect_attempts, 3);
        assert!(config.input.keyboard);
    }

    #[test]
    fn test_normalize_clamps() {
        let mut streamer = StreamerConfig {
            auto_join_interval_ms: 10,
            max_reconnect_attempts: 5000,
            ..Default::default()
        };
        streamer.normalize();
        assert_eq!(streamer.auto_join_interval_ms, MIN_AUTO_JOIN_INTERVAL_MS);
        assert_eq!(streamer.max_reconnect_attempts, MAX_RECONNECT_ATTEMPTS_LIMIT);
    }

    #[test]
    fn test_codec_options_keep_selection() {
        let mut pref = CodecPreference {
            selected: "VP8".to_string(),
            options: vec![],
        };
        pref.set_options(vec!["H264 profile-level-id=42e01f".into(), "VP8".into()]);
        assert_eq!(pref.selected, "VP8");

        pref.set_options(vec!["AV1".into()]);
        assert_eq!(pref.selected, "AV1");

        pref.set_options(vec![]);
        assert_eq!(pref.selected, "");
    }
}
