//! Connectivity-candidate admission policy

use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::signalling::{IceCandidate, PeerConnectionOptions};

/// Reason sent when relay-only mode is requested without a TURN server
pub const TURN_UNAVAILABLE_REASON: &str =
    "TURN cannot be forced, closing connection. Please use STUN instead.";

/// Which candidates may be exchanged with the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidatePolicy {
    /// Any candidate type
    #[default]
    All,
    /// Only relayed (TURN) candidates
    RelayOnly,
}

impl CandidatePolicy {
    pub fn from_force_turn(force_turn: bool) -> Self {
        if force_turn {
            Self::RelayOnly
        } else {
            Self::All
        }
    }

    /// Whether `candidate` may be sent or applied
    ///
    /// Empty candidate strings (end-of-candidates) are never admitted.
    pub fn admits(&self, candidate: &IceCandidate) -> bool {
        if candidate.candidate.trim().is_empty() {
            return false;
        }
        match self {
            Self::All => true,
            Self::RelayOnly => candidate.candidate.contains("relay"),
        }
    }
}

/// Whether any configured server is a TURN server
pub fn turn_available(options: &PeerConnectionOptions) -> bool {
    options.urls().any(|url| url.contains("turn"))
}

/// Convert signalled ICE servers to webrtc-rs servers
pub fn to_rtc_ice_servers(options: &PeerConnectionOptions) -> Vec<RTCIceServer> {
    options
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.as_slice().to_vec(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signalling::{IceServer, IceUrls};

    fn options(urls: &[&str]) -> PeerConnectionOptions {
        PeerConnectionOptions {
            ice_servers: vec![IceServer {
                urls: IceUrls::Many(urls.iter().map(|u| u.to_string()).collect()),
                username: Some("user".to_string()),
                credential: None,
            }],
        }
    }

    #[test]
    fn test_relay_only_policy() {
        let relay = IceCandidate::new(
            "candidate:1 1 udp 41885439 203.0.113.5 50000 typ relay raddr 0.0.0.0 rport 0",
        );
        let host = IceCandidate::new("candidate:2 1 udp 2122260223 192.168.1.4 50001 typ host");

        let policy = CandidatePolicy::from_force_turn(true);
        assert!(policy.admits(&relay));
        assert!(!policy.admits(&host));

        let policy = CandidatePolicy::from_force_turn(false);
        assert!(policy.admits(&host));
        assert!(!policy.admits(&IceCandidate::new("")));
    }

    #[test]
    fn test_turn_available() {
        assert!(!turn_available(&options(&["stun:stun.l.google.com:19302"])));
        assert!(turn_available(&options(&[
            "stun:stun.example.com",
            "turn:turn.example.com:3478?transport=udp"
        ])));
        assert!(!turn_available(&PeerConnectionOptions::default()));
    }

    #[test]
    fn test_to_rtc_ice_servers() {
        let servers = to_rtc_ice_servers(&options(&["turns:turn.example.com:5349"]));
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["turns:turn.example.com:5349".to_string()]);
        assert_eq!(servers[0].username, "user");
        assert_eq!(servers[0].credential, "");
    }
}
