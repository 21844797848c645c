//! Signalling wire messages
//!
//! Every message is a JSON object with a `type` field; the remaining
//! fields depend on the type. Unknown extra fields (e.g. `playerId` added
//! by the relay) are ignored.

use serde::{Deserialize, Serialize};

/// Signalling protocol version this client speaks
pub const SIGNALLING_PROTOCOL_VERSION: &str = "1.2.1";

/// Messages received from the signalling server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundMessage {
    /// Connection configuration (ICE servers)
    Config {
        #[serde(rename = "peerConnectionOptions", default)]
        peer_connection_options: PeerConnectionOptions,
        #[serde(rename = "protocolVersion", default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<String>,
    },
    /// Server asks the client to identify itself
    Identify,
    /// Keepalive request; answered with a pong carrying the same time
    Ping { time: f64 },
    /// Keepalive response
    Pong { time: f64 },
    /// Currently joinable streamers
    StreamerList {
        #[serde(default)]
        ids: Vec<String>,
    },
    /// Subscribe request was rejected
    SubscribeFailed {
        #[serde(default)]
        message: String,
    },
    /// The subscribed streamer was renamed
    StreamerIdChanged {
        #[serde(rename = "newID")]
        new_id: String,
    },
    /// The subscribed streamer went away
    StreamerDisconnected,
    /// Number of connected players
    PlayerCount { count: u32 },
    /// Remote answer to a locally created offer
    Answer { sdp: String },
    /// Remote offer
    Offer {
        sdp: String,
        /// Offer comes from an SFU
        #[serde(default)]
        sfu: bool,
        /// Layered (SVC) codec hint
        #[serde(rename = "scalabilityMode", default, skip_serializing_if = "Option::is_none")]
        scalability_mode: Option<serde_json::Value>,
    },
    /// SFU data channel stream ids
    PeerDataChannels {
        #[serde(rename = "sendStreamId")]
        send_stream_id: u16,
        #[serde(rename = "recvStreamId")]
        recv_stream_id: u16,
    },
    /// Remote ICE candidate
    IceCandidate { candidate: IceCandidate },
}

impl InboundMessage {
    /// Wire `type` of the message
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Identify => "identify",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::StreamerList { .. } => "streamerList",
            Self::SubscribeFailed { .. } => "subscribeFailed",
            Self::StreamerIdChanged { .. } => "streamerIdChanged",
            Self::StreamerDisconnected => "streamerDisconnected",
            Self::PlayerCount { .. } => "playerCount",
            Self::Answer { .. } => "answer",
            Self::Offer { .. } => "offer",
            Self::PeerDataChannels { .. } => "peerDataChannels",
            Self::IceCandidate { .. } => "iceCandidate",
        }
    }
}

/// Messages sent to the signalling server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    ListStreamers,
    Subscribe {
        #[serde(rename = "streamerId")]
        streamer_id: String,
    },
    Unsubscribe,
    Offer(SessionDescriptionMessage),
    Answer(SessionDescriptionMessage),
    IceCandidate { candidate: IceCandidate },
    DataChannelRequest,
    PeerDataChannelsReady,
    Ping { time: f64 },
    Pong { time: f64 },
}

impl OutboundMessage {
    /// Serialize to the JSON text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Local offer/answer with bitrate hints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDescriptionMessage {
    pub sdp: String,
    #[serde(rename = "minBitrateBps")]
    pub min_bitrate_bps: u64,
    #[serde(rename = "maxBitrateBps")]
    pub max_bitrate_bps: u64,
}

impl SessionDescriptionMessage {
    /// Build from kbps settings
    pub fn new(sdp: impl Into<String>, min_kbps: u32, max_kbps: u32) -> Self {
        Self {
            sdp: sdp.into(),
            min_bitrate_bps: 1000 * u64::from(min_kbps),
            max_bitrate_bps: 1000 * u64::from(max_kbps),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Peer connection options carried by the `config` message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PeerConnectionOptions {
    #[serde(rename = "iceServers", default)]
    pub ice_servers: Vec<IceServer>,
}

impl PeerConnectionOptions {
    /// All configured server URLs
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.ice_servers.iter().flat_map(|s| s.urls.as_slice()).map(String::as_str)
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// `urls` may be a single string or a list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn as_slice(&self) -> &[String] {
        match self {
            IceUrls::One(url) => std::slice::from_ref(url),
            IceUrls::Many(urls) => urls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offer_with_flags() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"type":"offer","sdp":"v=0\r\n","sfu":true,"scalabilityMode":"L1T3","playerId":"7"}"#,
        )
        .unwrap();

        match msg {
            InboundMessage::Offer {
                sdp,
                sfu,
                scalability_mode,
            } => {
                assert_eq!(sdp, "v=0\r\n");
                assert!(sfu);
                assert_eq!(scalability_mode, Some(serde_json::json!("L1T3")));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_config_ice_servers() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"type":"config","peerConnectionOptions":{"iceServers":[
                {"urls":"stun:stun.example.com:19302"},
                {"urls":["turn:turn.example.com:3478"],"username":"u","credential":"p"}
            ]}}"#,
        )
        .unwrap();

        let InboundMessage::Config {
            peer_connection_options,
            ..
        } = msg
        else {
            panic!("expected config");
        };
        let urls: Vec<&str> = peer_connection_options.urls().collect();
        assert_eq!(
            urls,
            vec!["stun:stun.example.com:19302", "turn:turn.example.com:3478"]
        );
    }

    #[test]
    fn test_parse_renamed_fields() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"type":"streamerIdChanged","newID":"B"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::StreamerIdChanged {
                new_id: "B".to_string()
            }
        );

        let msg: InboundMessage = serde_json::from_str(
            r#"{"type":"peerDataChannels","sendStreamId":2,"recvStreamId":3}"#,
        )
        .unwrap();
        assert_eq!(msg.type_name(), "peerDataChannels");
    }

    #[test]
    fn test_outbound_wire_format() {
        let json = OutboundMessage::Subscribe {
            streamer_id: "A".into(),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"subscribe","streamerId":"A"}"#);

        let json = OutboundMessage::Answer(SessionDescriptionMessage::new("x", 100, 2000))
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "answer");
        assert_eq!(value["minBitrateBps"], 100_000);
        assert_eq!(value["maxBitrateBps"], 2_000_000);

        let json = OutboundMessage::ListStreamers.to_json().unwrap();
        assert_eq!(json, r#"{"type":"listStreamers"}"#);
    }

    #[test]
    fn test_candidate_omits_missing_fields() {
        let json = OutboundMessage::IceCandidate {
            candidate: IceCandidate::new("candidate:1 1 udp 1 1.2.3.4 5 typ relay"),
        }
        .to_json()
        .unwrap();
        assert!(!json.contains("sdpMid"));
        assert!(json.contains(r#""type":"iceCandidate""#));
    }
}
