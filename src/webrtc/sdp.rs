//! Session description rewriting
//!
//! All functions take the description by reference and return a new
//! string. Applying a transform twice gives the same result as once.

use tracing::debug;

/// RTP header extension carrying the sender capture time
pub const ABS_CAPTURE_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-capture-time";

const BITRATE_HINT: &str = ";x-google-start-bitrate=10000;x-google-max-bitrate=100000";
const OPUS_FEC: &str = "useinbandfec=1";

/// Description of the runtime hosting the media stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeProfile {
    pub name: String,
    capture_time_ext_compatible: bool,
}

impl RuntimeProfile {
    /// The native webrtc-rs stack
    pub fn native() -> Self {
        Self {
            name: "webrtc-rs".to_string(),
            capture_time_ext_compatible: true,
        }
    }

    /// Classify a browser user agent string
    ///
    /// Firefox caps the number of header extensions and fails negotiation
    /// when the capture-time extension is added.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let firefox = user_agent.contains("Firefox");
        Self {
            name: if firefox { "firefox" } else { "chromium" }.to_string(),
            capture_time_ext_compatible: !firefox,
        }
    }

    pub fn supports_capture_time_ext(&self) -> bool {
        self.capture_time_ext_compatible
    }
}

impl Default for RuntimeProfile {
    fn default() -> Self {
        Self::native()
    }
}

/// Microphone capture is only attempted against local or secure endpoints
pub fn mic_permitted(signalling_url: &str) -> bool {
    let (scheme, rest) = signalling_url.split_once("://").unwrap_or(("", signalling_url));
    if scheme.eq_ignore_ascii_case("wss") || scheme.eq_ignore_ascii_case("https") {
        return true;
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let host = if let Some(stripped) = authority.strip_prefix('[') {
        stripped.split(']').next().unwrap_or_default()
    } else {
        authority.split(':').next().unwrap_or_default()
    };

    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Audio parameters merged into the Opus fmtp line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioParams {
    pub use_mic: bool,
    pub force_mono: bool,
}

/// Policy applied to every description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformPolicy {
    pub audio: AudioParams,
    /// Capture-time extension requested by settings
    pub enable_capture_time_ext: bool,
}

/// Applies the policy to local and remote descriptions
#[derive(Debug, Clone, Default)]
pub struct SdpTransformer {
    policy: TransformPolicy,
    runtime: RuntimeProfile,
}

impl SdpTransformer {
    pub fn new(policy: TransformPolicy, runtime: RuntimeProfile) -> Self {
        Self { policy, runtime }
    }

    /// Whether the capture-time extension will be added
    pub fn capture_time_ext_active(&self) -> bool {
        self.policy.enable_capture_time_ext && self.runtime.supports_capture_time_ext()
    }

    /// Rewrite a locally generated offer or answer before committing it
    pub fn munge_local(&self, sdp: &str) -> String {
        let sdp = inject_bitrate_hints(sdp);
        let sdp = rewrite_audio_params(&sdp, self.policy.audio);
        if self.capture_time_ext_active() {
            add_capture_time_extension(&sdp)
        } else {
            sdp
        }
    }

    /// Clean up a remote offer before it is applied
    pub fn prepare_remote(&self, sdp: &str) -> String {
        if self.runtime.supports_capture_time_ext() {
            sdp.to_string()
        } else {
            strip_capture_time_extension(sdp)
        }
    }
}

/// Line ending used by the description
fn eol(sdp: &str) -> &'static str {
    if sdp.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// Rewrite lines, keeping each line's original terminator
fn map_lines<F>(sdp: &str, mut f: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(sdp.len() + 128);
    for raw in sdp.split_inclusive('\n') {
        let content = raw.trim_end_matches(['\r', '\n']);
        let ending = &raw[content.len()..];
        match f(content) {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(content),
        }
        out.push_str(ending);
    }
    out
}

/// Append start/max bitrate hints to codecs that allow level asymmetry
pub fn inject_bitrate_hints(sdp: &str) -> String {
    map_lines(sdp, |line| {
        let is_target = line.starts_with("a=fmtp:")
            && line.contains("level-asymmetry-allowed=")
            && !line.contains("x-google-start-bitrate");
        is_target.then(|| format!("{}{}", line, BITRATE_HINT))
    })
}

/// Replace the first Opus `useinbandfec=1` with the full audio parameter set
pub fn rewrite_audio_params(sdp: &str, params: AudioParams) -> String {
    if sdp.contains("maxaveragebitrate=") {
        return sdp.to_string();
    }

    let mut audio = String::from("maxaveragebitrate=510000;");
    if params.use_mic {
        audio.push_str("sprop-maxcapturerate=48000;");
    }
    audio.push_str(if params.force_mono { "stereo=0;" } else { "stereo=1;" });
    audio.push_str(OPUS_FEC);

    sdp.replacen(OPUS_FEC, &audio, 1)
}

fn extmap_id(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("a=extmap:")?;
    let id = rest.split([' ', '/']).next()?;
    id.parse().ok()
}

/// Add the capture-time header extension to every video section
pub fn add_capture_time_extension(sdp: &str) -> String {
    let next_id = sdp.lines().filter_map(extmap_id).max().unwrap_or(0) + 1;
    let ext_line = format!("a=extmap:{} {}", next_id, ABS_CAPTURE_TIME_URI);
    let eol = eol(sdp);

    let mut out = String::with_capacity(sdp.len() + 2 * ext_line.len());
    let mut in_video = false;
    let mut has_ext = false;
    let mut added = 0;

    let mut close_section = |out: &mut String, in_video: bool, has_ext: bool| {
        if in_video && !has_ext {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push_str(eol);
            }
            out.push_str(&ext_line);
            out.push_str(eol);
            added += 1;
        }
    };

    for raw in sdp.split_inclusive('\n') {
        let content = raw.trim_end_matches(['\r', '\n']);
        if content.starts_with("m=") {
            close_section(&mut out, in_video, has_ext);
            in_video = content.starts_with("m=video");
            has_ext = false;
        } else if content.starts_with("a=extmap:") && content.contains(ABS_CAPTURE_TIME_URI) {
            has_ext = true;
        }
        out.push_str(raw);
    }
    close_section(&mut out, in_video, has_ext);

    debug!("Added capture-time extension (id {}) to {} video section(s)", next_id, added);
    out
}

/// Remove any capture-time header extension line
pub fn strip_capture_time_extension(sdp: &str) -> String {
    sdp.split_inclusive('\n')
        .filter(|raw| !(raw.starts_with("a=extmap:") && raw.contains(ABS_CAPTURE_TIME_URI)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &str = "v=0\r\n\
        o=- 1 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=fmtp:111 minptime=10;useinbandfec=1\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=extmap:3 urn:ietf:params:rtp-hdrext:toffset\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n";

    #[test]
    fn test_bitrate_hints() {
        let out = inject_bitrate_hints(ANSWER);
        assert!(out.contains(
            "a=fmtp:96 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f;x-google-start-bitrate=10000;x-google-max-bitrate=100000\r\n"
        ));
        assert!(out.contains("a=fmtp:111 minptime=10;useinbandfec=1\r\n"));
    }

    #[test]
    fn test_audio_params() {
        let stereo = rewrite_audio_params(ANSWER, AudioParams::default());
        assert!(stereo.contains("a=fmtp:111 minptime=10;maxaveragebitrate=510000;stereo=1;useinbandfec=1\r\n"));

        let mono_mic = rewrite_audio_params(
            ANSWER,
            AudioParams {
                use_mic: true,
                force_mono: true,
            },
        );
        assert!(mono_mic.contains("maxaveragebitrate=510000;sprop-maxcapturerate=48000;stereo=0;useinbandfec=1"));
    }

    #[test]
    fn test_capture_time_extension() {
        let out = add_capture_time_extension(ANSWER);
        assert!(out.ends_with(&format!("a=extmap:4 {}\r\n", ABS_CAPTURE_TIME_URI)));
        assert_eq!(out.matches(ABS_CAPTURE_TIME_URI).count(), 1);

        let audio_section = out.split("m=video").next().unwrap();
        assert!(!audio_section.contains(ABS_CAPTURE_TIME_URI));
    }

    #[test]
    fn test_munge_is_idempotent_and_pure() {
        let transformer = SdpTransformer::new(
            TransformPolicy {
                audio: AudioParams::default(),
                enable_capture_time_ext: true,
            },
            RuntimeProfile::native(),
        );
        let input = ANSWER.to_string();
        let once = transformer.munge_local(&input);
        let twice = transformer.munge_local(&once);
        assert_eq!(once, twice);
        assert_eq!(input, ANSWER);
    }

    #[test]
    fn test_incompatible_runtime_gates_extension() {
        let firefox = RuntimeProfile::from_user_agent(
            "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
        );
        assert!(!firefox.supports_capture_time_ext());

        let transformer = SdpTransformer::new(
            TransformPolicy {
                audio: AudioParams::default(),
                enable_capture_time_ext: true,
            },
            firefox,
        );
        assert!(!transformer.capture_time_ext_active());
        assert!(!transformer.munge_local(ANSWER).contains(ABS_CAPTURE_TIME_URI));

        let remote = add_capture_time_extension(ANSWER);
        let cleaned = transformer.prepare_remote(&remote);
        assert!(!cleaned.contains(ABS_CAPTURE_TIME_URI));
        assert_eq!(cleaned, ANSWER);
    }

    #[test]
    fn test_mic_permitted() {
        assert!(mic_permitted("ws://localhost:8080/ws"));
        assert!(mic_permitted("ws://127.0.0.1"));
        assert!(mic_permitted("wss://stream.example.com"));
        assert!(mic_permitted("ws://[::1]:80"));
        assert!(!mic_permitted("ws://stream.example.com"));
        assert!(!mic_permitted("ws://192.168.1.20:80?StreamerId=a"));
    }
}
