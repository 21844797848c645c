//! Media negotiation
//!
//! Everything between the signalling messages and the peer connection:
//! - `codec`: remote/local codec intersection and re-selection
//! - `sdp`: session description munging
//! - `ice`: candidate admission and ICE server conversion
//! - `datachannel`: direct vs relayed channel topology
//! - `protocol`: binary data channel message table
//! - `peer`: media session trait and the webrtc-rs implementation
//!
//! ```text
//!  offer (signalling)
//!        |
//!        v
//!  SdpTransformer::prepare_remote -> negotiate_codecs
//!        |                                 |
//!        v                                 v
//!  MediaSession::set_remote   TransceiverPlan (codec order)
//!        |
//!        v
//!  create_answer -> SdpTransformer::munge_local -> set_local -> answer
//! ```

pub mod codec;
pub mod datachannel;
pub mod ice;
pub mod peer;
pub mod protocol;
pub mod sdp;

pub use codec::{CodecCapabilities, CodecSpec};
pub use datachannel::{ChannelRole, DataChannelBinding, DataChannelTopology};
pub use ice::CandidatePolicy;
pub use peer::{
    IceConnectionState, MediaDirection, MediaSession, PeerEvent, PeerFactory, PeerSettings,
    RtcMediaSession, RtcPeerFactory, SdpKind, TransceiverPlan,
};
pub use protocol::{FromStreamerMessage, ProtocolTable, StreamerMessage, ToStreamerMessage};
pub use sdp::{RuntimeProfile, SdpTransformer, TransformPolicy};
