//! Data channel topology
//!
//! In a direct session the streamer opens a single bidirectional channel.
//! Behind an SFU the channels are pre-negotiated with the stream ids from
//! the `peerDataChannels` message; when the ids differ there is one
//! channel per direction.

use serde::Serialize;

/// Label of the single bidirectional channel
pub const DATACHANNEL_LABEL: &str = "datachannel";
/// Label of the outbound channel in unidirectional mode
pub const SEND_DATACHANNEL_LABEL: &str = "send-datachannel";
/// Label of the inbound channel in unidirectional mode
pub const RECV_DATACHANNEL_LABEL: &str = "recv-datachannel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Bidirectional,
    SendOnly,
    RecvOnly,
}

/// One data channel of a session; immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataChannelBinding {
    pub role: ChannelRole,
    pub label: String,
    /// Negotiated stream id, `None` when the channel was opened by the remote
    pub stream_id: Option<u16>,
}

impl DataChannelBinding {
    /// A channel announced by the remote side
    pub fn remote(label: impl Into<String>) -> Self {
        Self {
            role: ChannelRole::Bidirectional,
            label: label.into(),
            stream_id: None,
        }
    }

    /// Whether inbound messages on this channel are processed
    pub fn receives(&self) -> bool {
        matches!(self.role, ChannelRole::Bidirectional | ChannelRole::RecvOnly)
    }

    /// Whether outbound messages go over this channel
    pub fn sends(&self) -> bool {
        matches!(self.role, ChannelRole::Bidirectional | ChannelRole::SendOnly)
    }
}

/// How data channels are laid out for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelTopology {
    /// Opened by the streamer
    Direct,
    /// Pre-negotiated through the SFU
    Relayed {
        send_stream_id: u16,
        recv_stream_id: u16,
    },
}

impl DataChannelTopology {
    pub fn relayed(send_stream_id: u16, recv_stream_id: u16) -> Self {
        Self::Relayed {
            send_stream_id,
            recv_stream_id,
        }
    }

    pub fn is_unidirectional(&self) -> bool {
        match self {
            Self::Direct => false,
            Self::Relayed {
                send_stream_id,
                recv_stream_id,
            } => send_stream_id != recv_stream_id,
        }
    }

    /// Channels the client creates itself (none in direct mode)
    pub fn bindings(&self) -> Vec<DataChannelBinding> {
        match *self {
            Self::Direct => Vec::new(),
            Self::Relayed {
                send_stream_id,
                recv_stream_id,
            } if send_stream_id != recv_stream_id => vec![
                DataChannelBinding {
                    role: ChannelRole::SendOnly,
                    label: SEND_DATACHANNEL_LABEL.to_string(),
                    stream_id: Some(send_stream_id),
                },
                DataChannelBinding {
                    role: ChannelRole::RecvOnly,
                    label: RECV_DATACHANNEL_LABEL.to_string(),
                    stream_id: Some(recv_stream_id),
                },
            ],
            Self::Relayed { send_stream_id, .. } => vec![DataChannelBinding {
                role: ChannelRole::Bidirectional,
                label: DATACHANNEL_LABEL.to_string(),
                stream_id: Some(send_stream_id),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unidirectional_bindings() {
        let topology = DataChannelTopology::relayed(3, 4);
        assert!(topology.is_unidirectional());

        let bindings = topology.bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].label, SEND_DATACHANNEL_LABEL);
        assert_eq!(bindings[0].stream_id, Some(3));
        assert!(bindings[0].sends() && !bindings[0].receives());
        assert_eq!(bindings[1].label, RECV_DATACHANNEL_LABEL);
        assert_eq!(bindings[1].stream_id, Some(4));
        assert!(bindings[1].receives() && !bindings[1].sends());
    }

    #[test]
    fn test_shared_stream_id_is_bidirectional() {
        let bindings = DataChannelTopology::relayed(7, 7).bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].label, DATACHANNEL_LABEL);
        assert_eq!(bindings[0].role, ChannelRole::Bidirectional);
    }

    #[test]
    fn test_direct_topology() {
        assert!(DataChannelTopology::Direct.bindings().is_empty());
        let remote = DataChannelBinding::remote("cirrus");
        assert!(remote.sends() && remote.receives());
        assert_eq!(remote.stream_id, None);
    }
}
