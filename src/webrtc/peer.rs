//! Media session management
//!
//! The controller drives a [`MediaSession`] created by a [`PeerFactory`].
//! Asynchronous callbacks from the underlying peer connection are
//! delivered as [`PeerEvent`]s on an mpsc channel so the controller sees
//! them on its own event loop.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{
    MediaEngine, MIME_TYPE_AV1, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::codec::{CodecCapabilities, CodecSpec};
use super::datachannel::{ChannelRole, DataChannelBinding};
use super::ice::{to_rtc_ice_servers, CandidatePolicy};
use crate::error::{AppError, Result};
use crate::signalling::{IceCandidate, PeerConnectionOptions};
use crate::stats::RawStats;

/// Which side produced a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// `connected` or `completed`; some stacks skip straight to the latter
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

impl std::fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Transceiver direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    RecvOnly,
    SendOnly,
    Inactive,
}

impl From<MediaDirection> for RTCRtpTransceiverDirection {
    fn from(direction: MediaDirection) -> Self {
        match direction {
            MediaDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
            MediaDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
            MediaDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
            MediaDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
        }
    }
}

/// Transceiver layout for one negotiation cycle
#[derive(Debug, Clone, PartialEq)]
pub struct TransceiverPlan {
    pub video: MediaDirection,
    pub audio: MediaDirection,
    /// Receive codec order for video, most preferred first
    pub video_codecs: Vec<CodecSpec>,
}

impl TransceiverPlan {
    /// Video is always received; audio and video are sent only when capture is on
    pub fn new(use_mic: bool, use_camera: bool, video_codecs: Vec<CodecSpec>) -> Self {
        Self {
            video: if use_camera {
                MediaDirection::SendRecv
            } else {
                MediaDirection::RecvOnly
            },
            audio: if use_mic {
                MediaDirection::SendRecv
            } else {
                MediaDirection::RecvOnly
            },
            video_codecs,
        }
    }
}

/// Callbacks from the peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate was gathered
    LocalCandidate(IceCandidate),
    IceConnectionState(IceConnectionState),
    /// The peer connection reached `failed`
    ConnectionFailed,
    DataChannelOpen { label: String },
    DataChannelClose { label: String },
    DataChannelMessage { label: String, data: Bytes },
    /// A remote track started (`"video"` or `"audio"`)
    Track { kind: String },
}

/// Parameters for a new peer connection
#[derive(Debug, Clone, Default)]
pub struct PeerSettings {
    pub options: PeerConnectionOptions,
    pub policy: CandidatePolicy,
}

/// Creates media sessions
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        settings: PeerSettings,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaSession>>;
}

/// One peer connection
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Video codecs this session can receive
    fn local_codecs(&self) -> CodecCapabilities;

    async fn apply_transceiver_plan(&self, plan: &TransceiverPlan) -> Result<()>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()>;

    async fn create_offer(&self) -> Result<String>;

    async fn create_answer(&self) -> Result<String>;

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Create the local side of the given data channels
    async fn create_data_channels(&self, bindings: &[DataChannelBinding]) -> Result<()>;

    /// Send on the channel bound for sending
    async fn send_data(&self, data: Bytes) -> Result<()>;

    async fn stats(&self) -> Result<RawStats>;

    async fn close(&self) -> Result<()>;
}

/// Video codecs registered with the media engine: (payload type, mime, fmtp)
const VIDEO_CODECS: &[(u8, &str, &str)] = &[
    (
        102,
        MIME_TYPE_H264,
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
    ),
    (
        108,
        MIME_TYPE_H264,
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
    ),
    (
        112,
        MIME_TYPE_H264,
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=64001f",
    ),
    (96, MIME_TYPE_VP8, ""),
    (98, MIME_TYPE_VP9, "profile-id=0"),
    (41, MIME_TYPE_AV1, "level-idx=5;profile=0;tier=0"),
];

const OPUS_PAYLOAD_TYPE: u8 = 111;

fn video_feedback() -> Vec<RTCPFeedback> {
    [
        ("goog-remb", ""),
        ("ccm", "fir"),
        ("nack", ""),
        ("nack", "pli"),
        ("transport-cc", ""),
    ]
    .into_iter()
    .map(|(typ, parameter)| RTCPFeedback {
        typ: typ.to_string(),
        parameter: parameter.to_string(),
    })
    .collect()
}

fn registered_video_codecs() -> Vec<RTCRtpCodecParameters> {
    VIDEO_CODECS
        .iter()
        .map(|(payload_type, mime, fmtp)| RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: mime.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: fmtp.to_string(),
                rtcp_feedback: video_feedback(),
            },
            payload_type: *payload_type,
            ..Default::default()
        })
        .collect()
}

/// Codec strings for the registered video codecs
pub fn default_local_codecs() -> Vec<String> {
    VIDEO_CODECS
        .iter()
        .map(|(_, mime, fmtp)| CodecSpec::from_mime(mime, fmtp).to_string())
        .collect()
}

/// webrtc-rs backed factory
#[derive(Debug, Default, Clone)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        settings: PeerSettings,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaSession>> {
        let session = RtcMediaSession::new(settings, events).await?;
        Ok(Arc::new(session))
    }
}

/// Peer connection wrapper with event forwarding
pub struct RtcMediaSession {
    pc: Arc<RTCPeerConnection>,
    video_codecs: Vec<RTCRtpCodecParameters>,
    /// Channels by label
    channels: Arc<RwLock<HashMap<String, Arc<RTCDataChannel>>>>,
    /// Channel used by `send_data`
    send_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl RtcMediaSession {
    pub async fn new(
        settings: PeerSettings,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();

        let video_codecs = registered_video_codecs();
        for codec in &video_codecs {
            media_engine
                .register_codec(codec.clone(), RTPCodecType::Video)
                .map_err(|e| AppError::WebRtcError(format!("Failed to register codec: {}", e)))?;
        }
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: OPUS_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codec: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_setting_engine(SettingEngine::default())
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_transport_policy = match settings.policy {
            CandidatePolicy::RelayOnly => RTCIceTransportPolicy::Relay,
            CandidatePolicy::All => RTCIceTransportPolicy::All,
        };
        let rtc_config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(&settings.options),
            ice_transport_policy,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let session = Self {
            pc: Arc::new(pc),
            video_codecs,
            channels: Arc::new(RwLock::new(HashMap::new())),
            send_channel: Arc::new(RwLock::new(None)),
            events,
        };
        session.setup_event_handlers();

        info!(
            "Peer connection created ({} ICE servers, policy {:?})",
            settings.options.ice_servers.len(),
            settings.policy
        );
        Ok(session)
    }

    fn setup_event_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let state = match s {
                    RTCIceConnectionState::New => Some(IceConnectionState::New),
                    RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
                    RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
                    RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
                    RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
                    RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
                    RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    debug!("ICE connection state: {}", state);
                    let _ = events.send(PeerEvent::IceConnectionState(state));
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                info!("Peer connection state: {}", s);
                if s == RTCPeerConnectionState::Failed {
                    let _ = events.send(PeerEvent::ConnectionFailed);
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(c) = candidate else {
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => debug!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let events = self.events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = track.kind().to_string();
                info!("Remote {} track started", kind);
                let _ = events.send(PeerEvent::Track { kind });
                Box::pin(async {})
            },
        ));

        // Channels announced by the remote side (direct topology)
        let events = self.events.clone();
        let channels = self.channels.clone();
        let send_channel = self.send_channel.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                let channels = channels.clone();
                let send_channel = send_channel.clone();
                Box::pin(async move {
                    info!("Data channel announced by remote: {}", dc.label());
                    wire_data_channel(&dc, true, events);
                    channels.write().await.insert(dc.label().to_string(), dc.clone());
                    let mut send = send_channel.write().await;
                    if send.is_none() {
                        *send = Some(dc);
                    }
                })
            }));
    }

    /// Registered parameters for `specs`, in order and without duplicates
    fn codec_parameters(&self, specs: &[CodecSpec]) -> Vec<RTCRtpCodecParameters> {
        let mut ordered: Vec<RTCRtpCodecParameters> = Vec::new();
        for spec in specs {
            let as_spec = |p: &RTCRtpCodecParameters| {
                CodecSpec::from_mime(&p.capability.mime_type, &p.capability.sdp_fmtp_line)
            };
            let found = self
                .video_codecs
                .iter()
                .find(|p| as_spec(p) == *spec)
                .or_else(|| {
                    self.video_codecs
                        .iter()
                        .find(|p| as_spec(p).name.eq_ignore_ascii_case(&spec.name))
                });
            if let Some(codec) = found {
                if !ordered.iter().any(|p| p.payload_type == codec.payload_type) {
                    ordered.push(codec.clone());
                }
            }
        }
        ordered
    }
}

/// Forward open/close (and messages when `receives`) for one channel
fn wire_data_channel(
    dc: &Arc<RTCDataChannel>,
    receives: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let label = dc.label().to_string();

    let open_events = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        info!("Data channel '{}' open", open_label);
        let _ = open_events.send(PeerEvent::DataChannelOpen {
            label: open_label.clone(),
        });
        Box::pin(async {})
    }));

    let close_events = events.clone();
    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        info!("Data channel '{}' closed", close_label);
        let _ = close_events.send(PeerEvent::DataChannelClose {
            label: close_label.clone(),
        });
        Box::pin(async {})
    }));

    if receives {
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = events.send(PeerEvent::DataChannelMessage {
                label: label.clone(),
                data: msg.data,
            });
            Box::pin(async {})
        }));
    }
}

fn description(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription> {
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    }
    .map_err(|e| AppError::WebRtcError(format!("Invalid SDP {:?}: {}", kind, e)))
}

#[async_trait]
impl MediaSession for RtcMediaSession {
    fn local_codecs(&self) -> CodecCapabilities {
        CodecCapabilities::Available(
            self.video_codecs
                .iter()
                .map(|p| {
                    CodecSpec::from_mime(&p.capability.mime_type, &p.capability.sdp_fmtp_line)
                        .to_string()
                })
                .collect(),
        )
    }

    async fn apply_transceiver_plan(&self, plan: &TransceiverPlan) -> Result<()> {
        let existing = self.pc.get_transceivers().await;

        for (kind, direction) in [
            (RTPCodecType::Video, plan.video),
            (RTPCodecType::Audio, plan.audio),
        ] {
            if existing.iter().any(|t| t.kind() == kind) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: direction.into(),
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| {
                    AppError::WebRtcError(format!("Failed to add {} transceiver: {}", kind, e))
                })?;
        }

        let preferences = self.codec_parameters(&plan.video_codecs);
        if preferences.is_empty() {
            return Ok(());
        }
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.kind() != RTPCodecType::Video {
                continue;
            }
            if let Err(e) = transceiver.set_codec_preferences(preferences.clone()).await {
                warn!("Failed to set video codec preferences: {}", e);
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        self.pc
            .set_remote_description(description(kind, sdp)?)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set remote description: {}", e)))
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        self.pc
            .set_local_description(description(kind, sdp)?)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_data_channels(&self, bindings: &[DataChannelBinding]) -> Result<()> {
        for binding in bindings {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                negotiated: binding.stream_id,
                ..Default::default()
            };
            let dc = self
                .pc
                .create_data_channel(&binding.label, Some(init))
                .await
                .map_err(|e| {
                    AppError::WebRtcError(format!("Failed to create data channel: {}", e))
                })?;

            wire_data_channel(&dc, binding.receives(), self.events.clone());
            if binding.sends() {
                *self.send_channel.write().await = Some(dc.clone());
            }
            self.channels.write().await.insert(binding.label.clone(), dc);

            info!(
                "Data channel '{}' created ({:?}, stream id {:?})",
                binding.label, binding.role, binding.stream_id
            );
        }
        Ok(())
    }

    async fn send_data(&self, data: Bytes) -> Result<()> {
        let channel = self.send_channel.read().await;
        let Some(ref dc) = *channel else {
            return Err(AppError::WebRtcError("No data channel to send on".to_string()));
        };
        dc.send(&data)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to send data: {}", e)))?;
        Ok(())
    }

    async fn stats(&self) -> Result<RawStats> {
        let report = self.pc.get_stats().await;
        let reports = report.reports.into_iter().filter_map(|(id, entry)| {
            serde_json::to_value(&entry).ok().map(|value| (id, value))
        });
        Ok(RawStats::from_reports(reports))
    }

    async fn close(&self) -> Result<()> {
        self.channels.write().await.clear();
        *self.send_channel.write().await = None;
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

/// Role used for channels created for the local offer
pub fn local_offer_bindings() -> Vec<DataChannelBinding> {
    vec![DataChannelBinding {
        role: ChannelRole::Bidirectional,
        label: super::datachannel::DATACHANNEL_LABEL.to_string(),
        stream_id: None,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_directions() {
        let plan = TransceiverPlan::new(false, false, vec![]);
        assert_eq!(plan.video, MediaDirection::RecvOnly);
        assert_eq!(plan.audio, MediaDirection::RecvOnly);

        let plan = TransceiverPlan::new(true, false, vec![]);
        assert_eq!(plan.audio, MediaDirection::SendRecv);
        assert_eq!(
            RTCRtpTransceiverDirection::from(plan.video),
            RTCRtpTransceiverDirection::Recvonly
        );
    }

    #[test]
    fn test_ice_state_established() {
        assert!(IceConnectionState::Connected.is_established());
        assert!(IceConnectionState::Completed.is_established());
        assert!(!IceConnectionState::Checking.is_established());
        assert_eq!(IceConnectionState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_default_local_codecs() {
        let codecs = default_local_codecs();
        assert_eq!(
            codecs[0],
            "H264 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
        );
        assert!(codecs.contains(&"VP8".to_string()));
        assert!(codecs.contains(&"VP9 profile-id=0".to_string()));
    }

    #[tokio::test]
    async fn test_rtc_session_reports_local_codecs() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = RtcPeerFactory::new()
            .create(PeerSettings::default(), tx)
            .await
            .unwrap();

        assert_eq!(
            session.local_codecs(),
            CodecCapabilities::Available(default_local_codecs())
        );
        session.close().await.unwrap();
    }
}
