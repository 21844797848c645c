//! Raw statistics and the normalised per-tick snapshot

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::webrtc::codec::CodecSpec;

/// Timestamps below this are taken to be seconds rather than milliseconds
const SECONDS_TIMESTAMP_LIMIT: f64 = 1e11;

/// Entry type carrying `abs-capture-time` data for the video receiver
pub const CAPTURE_SOURCE_TYPE: &str = "capture-source";

/// One statistics record as reported by the media stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStatsEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub stats_type: String,
    /// Remaining members with camelCase keys
    pub fields: Map<String, Value>,
}

impl RawStatsEntry {
    pub fn new(id: impl Into<String>, stats_type: impl Into<String>, fields: Value) -> Self {
        Self {
            id: id.into(),
            stats_type: stats_type.into(),
            fields: match fields {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    /// Build from a serialized report
    ///
    /// Accepts browser-shaped objects (`{"id", "type", ...camelCase}`) as
    /// well as serialized webrtc-rs reports (snake_case keys, `stats_type`,
    /// optionally wrapped in a single-key enum object).
    pub fn from_value(id_hint: &str, value: Value) -> Option<Self> {
        let object = match value {
            Value::Object(map) => unwrap_enum(map),
            _ => return None,
        };

        let mut fields = Map::new();
        let mut stats_type = None;
        let mut id = None;
        for (key, value) in object {
            match key.as_str() {
                "type" | "stats_type" | "statsType" => {
                    stats_type = value.as_str().map(normalize_type);
                }
                "id" => id = value.as_str().map(str::to_string),
                _ => {
                    fields.insert(to_camel_case(&key), value);
                }
            }
        }

        Some(Self {
            id: id.unwrap_or_else(|| id_hint.to_string()),
            stats_type: stats_type?,
            fields,
        })
    }
}

/// `{"InboundRTP": {...}}` -> `{...}`
fn unwrap_enum(map: Map<String, Value>) -> Map<String, Value> {
    let wrapped = map.len() == 1 && map.values().all(Value::is_object);
    if !wrapped {
        return map;
    }
    match map.into_iter().next() {
        Some((_, Value::Object(inner))) => inner,
        _ => Map::new(),
    }
}

fn to_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// `InboundRTP`, `inbound_rtp` and `inbound-rtp` all become `inbound-rtp`
fn normalize_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for c in raw.chars() {
        if c == '_' || c == '-' {
            out.push('-');
            prev_lower = false;
        } else if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

/// A full statistics report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawStats {
    pub entries: Vec<RawStatsEntry>,
}

impl RawStats {
    /// Convert `(id, serialized report)` pairs, skipping unusable ones
    pub fn from_reports<I>(reports: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Self {
            entries: reports
                .into_iter()
                .filter_map(|(id, value)| RawStatsEntry::from_value(&id, value))
                .collect(),
        }
    }

    pub fn push(&mut self, entry: RawStatsEntry) {
        self.entries.push(entry);
    }
}

struct Fields<'a>(&'a Map<String, Value>);

impl Fields<'_> {
    fn num(&self, key: &str) -> Option<f64> {
        self.0.get(key)?.as_f64()
    }

    fn count(&self, key: &str) -> Option<u64> {
        let value = self.0.get(key)?;
        value.as_u64().or_else(|| value.as_f64().map(|f| f.max(0.0) as u64))
    }

    fn text(&self, key: &str) -> Option<String> {
        self.0.get(key)?.as_str().map(str::to_string)
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.0.get(key)?.as_bool()
    }

    fn millis(&self, key: &str) -> Option<f64> {
        self.num(key).map(|t| {
            if t < SECONDS_TIMESTAMP_LIMIT {
                t * 1000.0
            } else {
                t
            }
        })
    }
}

/// Inbound RTP stream (audio or video)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InboundRtpStats {
    pub id: String,
    pub timestamp: Option<f64>,
    pub codec_id: Option<String>,
    pub bytes_received: Option<u64>,
    pub packets_received: Option<u64>,
    pub packets_lost: Option<f64>,
    pub jitter: Option<f64>,
    pub frames_decoded: Option<u64>,
    pub frames_dropped: Option<u64>,
    pub frames_received: Option<u64>,
    pub key_frames_decoded: Option<u64>,
    pub frame_width: Option<u64>,
    pub frame_height: Option<u64>,
    pub frames_per_second: Option<f64>,
    pub qp_sum: Option<f64>,
    pub total_processing_delay: Option<f64>,
    pub jitter_buffer_delay: Option<f64>,
    pub jitter_buffer_emitted_count: Option<f64>,
    pub total_decode_time: Option<f64>,
    pub total_assembly_time: Option<f64>,
    pub frames_assembled_from_multiple_packets: Option<f64>,
    pub goog_timing_frame_info: Option<String>,
}

impl InboundRtpStats {
    fn from_fields(id: &str, f: &Fields<'_>) -> Self {
        Self {
            id: id.to_string(),
            timestamp: f.millis("timestamp"),
            codec_id: f.text("codecId"),
            bytes_received: f.count("bytesReceived"),
            packets_received: f.count("packetsReceived"),
            packets_lost: f.num("packetsLost"),
            jitter: f.num("jitter"),
            frames_decoded: f.count("framesDecoded"),
            frames_dropped: f.count("framesDropped"),
            frames_received: f.count("framesReceived"),
            key_frames_decoded: f.count("keyFramesDecoded"),
            frame_width: f.count("frameWidth"),
            frame_height: f.count("frameHeight"),
            frames_per_second: f.num("framesPerSecond"),
            qp_sum: f.num("qpSum"),
            total_processing_delay: f.num("totalProcessingDelay"),
            jitter_buffer_delay: f.num("jitterBufferDelay"),
            jitter_buffer_emitted_count: f.num("jitterBufferEmittedCount"),
            total_decode_time: f.num("totalDecodeTime"),
            total_assembly_time: f.num("totalAssemblyTime"),
            frames_assembled_from_multiple_packets: f.num("framesAssembledFromMultiplePackets"),
            goog_timing_frame_info: f.text("googTimingFrameInfo"),
        }
    }
}

/// Locally sent RTP stream (mic/camera)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutboundRtpStats {
    pub id: String,
    pub timestamp: Option<f64>,
    pub codec_id: Option<String>,
    pub bytes_sent: Option<u64>,
    pub packets_sent: Option<u64>,
    pub frames_encoded: Option<u64>,
}

/// Sender report data for a remote stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RemoteOutboundRtpStats {
    pub id: String,
    pub timestamp: Option<f64>,
    pub remote_timestamp: Option<f64>,
    pub total_round_trip_time: Option<f64>,
    pub round_trip_time_measurements: Option<f64>,
    pub bytes_sent: Option<u64>,
    pub packets_sent: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CandidatePairStats {
    pub id: String,
    pub selected: bool,
    pub nominated: bool,
    pub state: Option<String>,
    pub current_round_trip_time: Option<f64>,
    pub available_incoming_bitrate: Option<f64>,
    pub local_candidate_id: Option<String>,
    pub remote_candidate_id: Option<String>,
    pub bytes_received: Option<u64>,
    pub bytes_sent: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CandidateStats {
    pub id: String,
    pub address: Option<String>,
    pub port: Option<u64>,
    pub protocol: Option<String>,
    pub candidate_type: Option<String>,
    pub relay_protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CodecStats {
    pub id: String,
    pub mime_type: String,
    pub sdp_fmtp_line: Option<String>,
    pub payload_type: Option<u64>,
    pub clock_rate: Option<u64>,
}

impl CodecStats {
    /// `"NAME k=v;k=v"` form used for codec preferences
    pub fn codec_string(&self) -> String {
        CodecSpec::from_mime(&self.mime_type, self.sdp_fmtp_line.as_deref().unwrap_or_default())
            .to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataChannelStats {
    pub label: Option<String>,
    pub state: Option<String>,
    pub messages_sent: Option<u64>,
    pub messages_received: Option<u64>,
    pub bytes_sent: Option<u64>,
    pub bytes_received: Option<u64>,
}

/// Synchronisation source carrying `abs-capture-time` values
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CaptureSource {
    /// Receive time (ms, receiver clock)
    pub timestamp: f64,
    /// Capture time (ms, NTP epoch, sender clock)
    pub capture_timestamp: f64,
    pub sender_capture_time_offset: f64,
}

/// Normalised statistics for one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub inbound_video: Option<InboundRtpStats>,
    pub inbound_audio: Option<InboundRtpStats>,
    pub outbound_video: Option<OutboundRtpStats>,
    pub outbound_audio: Option<OutboundRtpStats>,
    pub remote_outbound_video: Option<RemoteOutboundRtpStats>,
    pub remote_outbound_audio: Option<RemoteOutboundRtpStats>,
    pub candidate_pairs: Vec<CandidatePairStats>,
    pub selected_candidate_pair_id: Option<String>,
    pub local_candidates: Vec<CandidateStats>,
    pub remote_candidates: Vec<CandidateStats>,
    pub codecs: HashMap<String, CodecStats>,
    pub data_channel: Option<DataChannelStats>,
    pub capture_source: Option<CaptureSource>,
}

impl StatsSnapshot {
    pub fn from_raw(raw: &RawStats) -> Self {
        let mut snapshot = Self::default();

        for entry in &raw.entries {
            let f = Fields(&entry.fields);
            let is_audio = f.text("kind").as_deref() == Some("audio");

            match entry.stats_type.as_str() {
                "inbound-rtp" => {
                    let stats = InboundRtpStats::from_fields(&entry.id, &f);
                    if is_audio {
                        snapshot.inbound_audio = Some(stats);
                    } else {
                        snapshot.inbound_video = Some(stats);
                    }
                }
                "outbound-rtp" => {
                    let stats = OutboundRtpStats {
                        id: entry.id.clone(),
                        timestamp: f.millis("timestamp"),
                        codec_id: f.text("codecId"),
                        bytes_sent: f.count("bytesSent"),
                        packets_sent: f.count("packetsSent"),
                        frames_encoded: f.count("framesEncoded"),
                    };
                    if is_audio {
                        snapshot.outbound_audio = Some(stats);
                    } else {
                        snapshot.outbound_video = Some(stats);
                    }
                }
                "remote-outbound-rtp" => {
                    let stats = RemoteOutboundRtpStats {
                        id: entry.id.clone(),
                        timestamp: f.millis("timestamp"),
                        remote_timestamp: f.millis("remoteTimestamp"),
                        total_round_trip_time: f.num("totalRoundTripTime"),
                        round_trip_time_measurements: f.num("roundTripTimeMeasurements"),
                        bytes_sent: f.count("bytesSent"),
                        packets_sent: f.count("packetsSent"),
                    };
                    if is_audio {
                        snapshot.remote_outbound_audio = Some(stats);
                    } else {
                        snapshot.remote_outbound_video = Some(stats);
                    }
                }
                "candidate-pair" => snapshot.candidate_pairs.push(CandidatePairStats {
                    id: entry.id.clone(),
                    selected: f.flag("selected").unwrap_or(false),
                    nominated: f.flag("nominated").unwrap_or(false),
                    state: f.text("state"),
                    current_round_trip_time: f.num("currentRoundTripTime"),
                    available_incoming_bitrate: f.num("availableIncomingBitrate"),
                    local_candidate_id: f.text("localCandidateId"),
                    remote_candidate_id: f.text("remoteCandidateId"),
                    bytes_received: f.count("bytesReceived"),
                    bytes_sent: f.count("bytesSent"),
                }),
                "local-candidate" | "remote-candidate" => {
                    let candidate = CandidateStats {
                        id: entry.id.clone(),
                        address: f.text("address").or_else(|| f.text("ip")),
                        port: f.count("port"),
                        protocol: f.text("protocol"),
                        candidate_type: f.text("candidateType"),
                        relay_protocol: f.text("relayProtocol"),
                    };
                    if entry.stats_type == "local-candidate" {
                        snapshot.local_candidates.push(candidate);
                    } else {
                        snapshot.remote_candidates.push(candidate);
                    }
                }
                "codec" => {
                    if let Some(mime_type) = f.text("mimeType") {
                        snapshot.codecs.insert(
                            entry.id.clone(),
                            CodecStats {
                                id: entry.id.clone(),
                                mime_type,
                                sdp_fmtp_line: f.text("sdpFmtpLine"),
                                payload_type: f.count("payloadType"),
                                clock_rate: f.count("clockRate"),
                            },
                        );
                    }
                }
                "data-channel" => {
                    snapshot.data_channel = Some(DataChannelStats {
                        label: f.text("label"),
                        state: f.text("state"),
                        messages_sent: f.count("messagesSent"),
                        messages_received: f.count("messagesReceived"),
                        bytes_sent: f.count("bytesSent"),
                        bytes_received: f.count("bytesReceived"),
                    })
                }
                "transport" => {
                    snapshot.selected_candidate_pair_id = f.text("selectedCandidatePairId");
                }
                CAPTURE_SOURCE_TYPE => {
                    if let (Some(timestamp), Some(capture_timestamp), Some(offset)) = (
                        f.num("timestamp"),
                        f.num("captureTimestamp"),
                        f.num("senderCaptureTimeOffset"),
                    ) {
                        snapshot.capture_source = Some(CaptureSource {
                            timestamp,
                            capture_timestamp,
                            sender_capture_time_offset: offset,
                        });
                    }
                }
                _ => {}
            }
        }

        snapshot
    }

    /// Candidate pair carrying media
    ///
    /// The transport's selected pair wins; otherwise the pair flagged
    /// `selected`, then a nominated pair that succeeded.
    pub fn active_candidate_pair(&self) -> Option<&CandidatePairStats> {
        if let Some(ref selected_id) = self.selected_candidate_pair_id {
            return self.candidate_pairs.iter().find(|p| &p.id == selected_id);
        }
        self.candidate_pairs.iter().find(|p| p.selected).or_else(|| {
            self.candidate_pairs
                .iter()
                .find(|p| p.nominated && p.state.as_deref() == Some("succeeded"))
        })
    }

    /// Codec string of the inbound video stream
    pub fn inbound_video_codec(&self) -> Option<String> {
        let codec_id = self.inbound_video.as_ref()?.codec_id.as_ref()?;
        self.codecs.get(codec_id).map(CodecStats::codec_string)
    }

    /// Codec string of the inbound audio stream
    pub fn inbound_audio_codec(&self) -> Option<String> {
        let codec_id = self.inbound_audio.as_ref()?.codec_id.as_ref()?;
        self.codecs.get(codec_id).map(CodecStats::codec_string)
    }
}
