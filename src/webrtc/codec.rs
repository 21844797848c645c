//! Video codec negotiation
//!
//! Codecs are exchanged as strings of the form `"NAME k=v;k=v"` (the name
//! alone when there are no format parameters), which is also what the
//! preferred-codec setting stores.

use std::fmt;

/// Surfaced instead of an empty list when the runtime cannot introspect codecs
pub const UNSUPPORTED_CODEC_SENTINEL: &str = "Only available on Chrome";

/// Codec assumed when the local capability list is unknown
pub const FALLBACK_CODEC: &str =
    "H264 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Local video codec capabilities
#[derive(Debug, Clone, PartialEq)]
pub enum CodecCapabilities {
    /// Codec strings the local stack can receive
    Available(Vec<String>),
    /// The runtime has no capability introspection
    Unavailable,
}

/// A codec name plus its ordered format parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecSpec {
    pub name: String,
    pub params: Vec<(String, String)>,
}

impl CodecSpec {
    /// Parse `"NAME k=v;k=v"`
    pub fn parse(codec: &str) -> Self {
        let codec = codec.trim();
        let (name, params) = codec.split_once(' ').unwrap_or((codec, ""));
        Self {
            name: name.to_string(),
            params: parse_fmtp(params),
        }
    }

    /// Build from a mime type (`video/H264`) and an fmtp line
    pub fn from_mime(mime_type: &str, fmtp: &str) -> Self {
        let name = mime_type.rsplit('/').next().unwrap_or(mime_type);
        Self {
            name: name.to_string(),
            params: parse_fmtp(fmtp),
        }
    }

    /// Format parameters joined as in an `a=fmtp` line
    pub fn fmtp(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{}={}", k, v) })
            .collect::<Vec<_>>()
            .join(";")
    }

    /// `video/NAME`
    pub fn mime_type(&self) -> String {
        format!("video/{}", self.name)
    }

    fn same_name(&self, other: &CodecSpec) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }

    /// Local params with `overlay`'s params replacing or appended
    fn merged_with(&self, overlay: &CodecSpec) -> CodecSpec {
        let mut params = self.params.clone();
        for (key, value) in &overlay.params {
            match params.iter_mut().find(|(k, _)| k == key) {
                Some(existing) => existing.1 = value.clone(),
                None => params.push((key.clone(), value.clone())),
            }
        }
        CodecSpec {
            name: self.name.clone(),
            params,
        }
    }
}

impl fmt::Display for CodecSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} {}", self.name, self.fmtp())
        }
    }
}

fn parse_fmtp(params: &str) -> Vec<(String, String)> {
    params
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (p.to_string(), String::new()),
        })
        .collect()
}

/// VPx, H26x and AV1 families
fn is_video_family(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    let digit_after = |prefix: &str| {
        upper
            .match_indices(prefix)
            .any(|(i, _)| upper[i + prefix.len()..].starts_with(|c: char| c.is_ascii_digit()))
    };
    upper.contains("AV1") || digit_after("VP") || digit_after("H26")
}

/// Extract the video codecs a remote description advertises
///
/// Payload types are visited in m-line order. VP9 is always reported
/// with `profile-id=0`.
pub fn parse_remote_codecs(sdp: &str) -> Vec<String> {
    let mut codecs: Vec<String> = Vec::new();

    for section in media_sections(sdp) {
        let Some(m_line) = section.first() else { continue };
        // m=<media> <port> <proto> <fmt> ...
        let payload_types: Vec<&str> = m_line.split_whitespace().skip(3).collect();

        for pt in payload_types {
            let rtpmap_prefix = format!("a=rtpmap:{} ", pt);
            let fmtp_prefix = format!("a=fmtp:{} ", pt);

            let Some(name) = section
                .iter()
                .find_map(|l| l.strip_prefix(rtpmap_prefix.as_str()))
                .and_then(|rest| rest.split('/').next())
            else {
                continue;
            };
            if !is_video_family(name) {
                continue;
            }

            let fmtp = section
                .iter()
                .find_map(|l| l.strip_prefix(fmtp_prefix.as_str()))
                .unwrap_or_default();

            let mut spec = CodecSpec {
                name: name.to_string(),
                params: parse_fmtp(fmtp),
            };
            if spec.name.eq_ignore_ascii_case("VP9") {
                spec.params = vec![("profile-id".to_string(), "0".to_string())];
            }

            let codec = spec.to_string();
            if !codecs.contains(&codec) {
                codecs.push(codec);
            }
        }
    }

    codecs
}

/// Split an SDP into its media sections (each starting with its `m=` line)
pub(crate) fn media_sections(sdp: &str) -> Vec<Vec<&str>> {
    let mut sections: Vec<Vec<&str>> = Vec::new();
    for line in sdp.lines().map(|l| l.trim_end_matches('\r')) {
        if line.starts_with("m=") {
            sections.push(vec![line]);
        } else if let Some(section) = sections.last_mut() {
            section.push(line);
        }
    }
    sections
}

/// Mutually usable codecs, in remote order
///
/// An exact local match wins; otherwise the first local codec with the
/// same name is taken, with the remote parameters merged over it.
pub fn intersect_codecs(remote: &[String], local: &[String]) -> Vec<String> {
    let local_specs: Vec<CodecSpec> = local.iter().map(|c| CodecSpec::parse(c)).collect();
    let mut result: Vec<String> = Vec::new();

    for remote_codec in remote {
        let remote_spec = CodecSpec::parse(remote_codec);

        let matched = if let Some(exact) = local_specs.iter().find(|l| **l == remote_spec) {
            Some(exact.to_string())
        } else {
            local_specs
                .iter()
                .find(|l| {
                    l.name
                        .to_ascii_uppercase()
                        .contains(&remote_spec.name.to_ascii_uppercase())
                })
                .map(|l| l.merged_with(&remote_spec).to_string())
        };

        if let Some(codec) = matched {
            if !result.contains(&codec) {
                result.push(codec);
            }
        }
    }

    result
}

/// Intersection against the local capabilities, or the sentinel list
pub fn negotiate_codecs(remote_sdp: &str, capabilities: &CodecCapabilities) -> Vec<String> {
    match capabilities {
        CodecCapabilities::Available(local) => {
            intersect_codecs(&parse_remote_codecs(remote_sdp), local)
        }
        CodecCapabilities::Unavailable => vec![UNSUPPORTED_CODEC_SENTINEL.to_string()],
    }
}

/// Map the codec reported by stats back onto the preference list
///
/// Exact match first, then name-only match.
pub fn reselect_codec(in_use: &str, preferences: &[String]) -> Option<String> {
    let in_use = CodecSpec::parse(in_use);
    let specs: Vec<(CodecSpec, &String)> =
        preferences.iter().map(|p| (CodecSpec::parse(p), p)).collect();

    specs
        .iter()
        .find(|(spec, _)| *spec == in_use)
        .or_else(|| specs.iter().find(|(spec, _)| spec.same_name(&in_use)))
        .map(|(_, original)| (*original).clone())
}

/// Receive codec order for transceivers: preferred first, the rest after
pub fn order_codec_preferences(preferred: &str, local: &[String]) -> Vec<CodecSpec> {
    let mut ordered = Vec::with_capacity(local.len() + 1);
    let preferred = preferred.trim();
    let preferred_spec =
        (!preferred.is_empty() && preferred != UNSUPPORTED_CODEC_SENTINEL).then(|| CodecSpec::parse(preferred));

    if let Some(ref spec) = preferred_spec {
        ordered.push(spec.clone());
    }
    for codec in local {
        let spec = CodecSpec::parse(codec);
        if preferred_spec.as_ref() != Some(&spec) {
            ordered.push(spec);
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    const REMOTE_OFFER: &str = "v=0\r\n\
        o=- 0 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=fmtp:111 minptime=10;useinbandfec=1\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96 97 98 99\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n\
        a=rtpmap:97 rtx/90000\r\n\
        a=fmtp:97 apt=96\r\n\
        a=rtpmap:98 VP9/90000\r\n\
        a=rtpmap:99 VP8/90000\r\n";

    #[test]
    fn test_parse_remote_codecs() {
        let codecs = parse_remote_codecs(REMOTE_OFFER);
        assert_eq!(
            codecs,
            vec![
                "H264 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
                "VP9 profile-id=0",
                "VP8",
            ]
        );
    }

    #[test]
    fn test_exact_match_scenario() {
        let remote = vec!["H264 profile-level-id=42e01f".to_string(), "VP8".to_string()];
        let local = vec!["H264 profile-level-id=42e01f".to_string()];
        assert_eq!(
            intersect_codecs(&remote, &local),
            vec!["H264 profile-level-id=42e01f"]
        );
    }

    #[test]
    fn test_fuzzy_match_merges_remote_params() {
        let remote = vec!["H264 profile-level-id=42e01f".to_string()];
        let local = vec!["H264 level-asymmetry-allowed=1;profile-level-id=640c1f".to_string()];
        assert_eq!(
            intersect_codecs(&remote, &local),
            vec!["H264 level-asymmetry-allowed=1;profile-level-id=42e01f"]
        );
    }

    #[test]
    fn test_intersection_is_order_stable_without_duplicates() {
        let remote: Vec<String> = ["VP8", "H264 packetization-mode=1", "VP8", "AV1", "H264 packetization-mode=1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let local: Vec<String> = [
            "AV1",
            "H264 packetization-mode=1;profile-level-id=42e01f",
            "H264 packetization-mode=0;profile-level-id=42e01f",
            "VP8",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let result = intersect_codecs(&remote, &local);
        assert_eq!(
            result,
            vec![
                "VP8",
                "H264 packetization-mode=1;profile-level-id=42e01f",
                "AV1",
            ]
        );

        let mut deduped = result.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), result.len());
    }

    #[test]
    fn test_unavailable_capabilities_surface_sentinel() {
        let codecs = negotiate_codecs(REMOTE_OFFER, &CodecCapabilities::Unavailable);
        assert_eq!(codecs, vec![UNSUPPORTED_CODEC_SENTINEL]);
    }

    #[test]
    fn test_reselect_prefers_exact_then_name() {
        let prefs = vec![
            "H264 packetization-mode=1;profile-level-id=42e01f".to_string(),
            "VP9 profile-id=0".to_string(),
        ];

        assert_eq!(
            reselect_codec("VP9 profile-id=0", &prefs).as_deref(),
            Some("VP9 profile-id=0")
        );
        assert_eq!(
            reselect_codec("H264 profile-level-id=640c1f", &prefs).as_deref(),
            Some("H264 packetization-mode=1;profile-level-id=42e01f")
        );
        assert_eq!(reselect_codec("AV1", &prefs), None);
    }

    #[test]
    fn test_order_codec_preferences() {
        let local = vec!["VP8".to_string(), "VP9 profile-id=0".to_string(), "AV1".to_string()];
        let ordered = order_codec_preferences("VP9 profile-id=0", &local);
        let names: Vec<String> = ordered.iter().map(|c| c.to_string()).collect();
        assert_eq!(names, vec!["VP9 profile-id=0", "VP8", "AV1"]);

        let unordered = order_codec_preferences("", &local);
        assert_eq!(unordered.len(), 3);
    }

    #[test]
    fn test_codec_spec_from_mime() {
        let spec = CodecSpec::from_mime("video/H264", "packetization-mode=1;profile-level-id=42e01f");
        assert_eq!(spec.to_string(), "H264 packetization-mode=1;profile-level-id=42e01f");
        assert_eq!(spec.mime_type(), "video/H264");
    }
}
