//! Setting overrides by well-known player setting names
//!
//! Hosts can hand the client a map of initial settings, and (when
//! `use_url_params` is on) the signalling URL's query string is read with
//! the same names, e.g. `?StreamerId=game&ForceTURN&MaxReconnectAttempts=5`.

use tracing::{debug, warn};

use super::AppConfig;

/// Apply every `key=value` pair of a URL query string
///
/// Returns the number of recognised settings.
pub fn apply_url_params(config: &mut AppConfig, url: &str) -> usize {
    let Some((_, query)) = url.split_once('?') else {
        return 0;
    };
    let query = query.split('#').next().unwrap_or_default();

    let mut applied = 0;
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        if apply_setting(config, key, &value) {
            applied += 1;
        }
    }
    config.streamer.normalize();
    applied
}

/// Apply a map of initial settings
pub fn apply_initial_settings<'a, I>(config: &mut AppConfig, settings: I) -> usize
where
    I: IntoIterator<Item = (&'a str, &'a serde_json::Value)>,
{
    let mut applied = 0;
    for (key, value) in settings {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if apply_setting(config, key, &value) {
            applied += 1;
        }
    }
    config.streamer.normalize();
    applied
}

/// Apply a single named setting; unknown names are ignored
pub fn apply_setting(config: &mut AppConfig, key: &str, value: &str) -> bool {
    match key {
        "ss" => config.signalling.url = value.to_string(),
        "StreamerId" => {
            config.streamer.streamer_id = (!value.is_empty()).then(|| value.to_string())
        }
        "PreferredCodec" => config.webrtc.preferred_codec.selected = value.to_string(),
        "AutoConnect" => config.streamer.auto_connect = parse_flag(value),
        "WaitForStreamer" => config.streamer.wait_for_streamer = parse_flag(value),
        "ForceTURN" => config.webrtc.force_turn = parse_flag(value),
        "ForceMonoAudio" => config.webrtc.force_mono_audio = parse_flag(value),
        "UseMic" => config.webrtc.use_mic = parse_flag(value),
        "UseCamera" => config.webrtc.use_camera = parse_flag(value),
        "EnableCaptureTimeExt" => config.webrtc.enable_capture_time_ext = parse_flag(value),
        "OfferToReceive" => config.webrtc.offer_to_receive = parse_flag(value),
        "KeyboardInput" => config.input.keyboard = parse_flag(value),
        "MouseInput" => config.input.mouse = parse_flag(value),
        "TouchInput" => config.input.touch = parse_flag(value),
        "GamepadInput" => config.input.gamepad = parse_flag(value),
        "MaxReconnectAttempts" => match value.parse() {
            Ok(v) => config.streamer.max_reconnect_attempts = v,
            Err(_) => return invalid(key, value),
        },
        "StreamerAutoJoinInterval" => match value.parse() {
            Ok(v) => config.streamer.auto_join_interval_ms = v,
            Err(_) => return invalid(key, value),
        },
        "KeepaliveDelay" => match value.parse() {
            Ok(v) => config.signalling.keepalive_delay_ms = v,
            Err(_) => return invalid(key, value),
        },
        "WebRTCMinBitrate" => match value.parse() {
            Ok(v) => config.webrtc.min_bitrate_kbps = v,
            Err(_) => return invalid(key, value),
        },
        "WebRTCMaxBitrate" => match value.parse() {
            Ok(v) => config.webrtc.max_bitrate_kbps = v,
            Err(_) => return invalid(key, value),
        },
        _ => {
            debug!("Ignoring unknown setting {}", key);
            return false;
        }
    }
    true
}

/// A bare flag (`?ForceTURN`) counts as enabled
fn parse_flag(value: &str) -> bool {
    !matches!(value.to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off")
}

fn invalid(key: &str, value: &str) -> bool {
    warn!("Invalid value for setting {}: {:?}", key, value);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_params() {
        let mut config = AppConfig::default();
        let applied = apply_url_params(
            &mut config,
            "wss://host/play?StreamerId=Game%201&ForceTURN&WaitForStreamer=false&MaxReconnectAttempts=4000",
        );

        assert_eq!(applied, 4);
        assert_eq!(config.streamer.streamer_id.as_deref(), Some("Game 1"));
        assert!(config.webrtc.force_turn);
        assert!(!config.streamer.wait_for_streamer);
        assert_eq!(config.streamer.max_reconnect_attempts, 999);
    }

    #[test]
    fn test_no_query() {
        let mut config = AppConfig::default();
        assert_eq!(apply_url_params(&mut config, "ws://localhost"), 0);
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_initial_settings() {
        let mut config = AppConfig::default();
        let settings = serde_json::json!({
            "StreamerAutoJoinInterval": 100,
            "UseMic": true,
            "PreferredCodec": "VP8",
            "Unknown": 1
        });
        let map = settings.as_object().unwrap();
        let applied = apply_initial_settings(&mut config, map.iter().map(|(k, v)| (k.as_str(), v)));

        assert_eq!(applied, 3);
        assert_eq!(config.streamer.auto_join_interval_ms, 500);
        assert!(config.webrtc.use_mic);
        assert_eq!(config.webrtc.preferred_codec.selected, "VP8");
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let mut config = AppConfig::default();
        assert!(!apply_setting(&mut config, "KeepaliveDelay", "soon"));
        assert_eq!(config.signalling.keepalive_delay_ms, 30_000);
    }
}
