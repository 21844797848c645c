//! Latency estimation from receiver statistics

use serde::Serialize;

use super::snapshot::{CaptureSource, StatsSnapshot};

/// Milliseconds between the NTP epoch (1900) and the Unix epoch
const NTP_UNIX_OFFSET_MS: f64 = 2_208_988_800_000.0;

/// Parsed `googTimingFrameInfo` for the slowest recent frame
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameTimingInfo {
    pub rtp_timestamp: i64,
    pub capture_timestamp: i64,
    pub encode_start_timestamp: i64,
    pub encode_finish_timestamp: i64,
    pub packetizer_finish_timestamp: i64,
    pub pacer_exit_timestamp: i64,
    pub network_timestamp1: i64,
    pub network_timestamp2: i64,
    pub receive_start: i64,
    pub receive_finish: i64,
    pub decode_start: i64,
    pub decode_finish: i64,
    pub render_time: i64,
    pub is_outlier: bool,
    pub is_triggered_by_timer: bool,

    pub encoder_latency_ms: i64,
    pub packetize_latency_ms: i64,
    pub pacer_latency_ms: i64,
    pub capture_to_send_latency_ms: i64,
}

impl FrameTimingInfo {
    /// Parse the 15-field comma separated form; anything else is rejected
    pub fn parse(info: &str) -> Option<Self> {
        let values: Vec<i64> = info
            .split(',')
            .map(|v| v.trim().parse::<i64>())
            .collect::<std::result::Result<_, _>>()
            .ok()?;
        if values.len() != 15 {
            return None;
        }

        let mut timing = Self {
            rtp_timestamp: values[0],
            capture_timestamp: values[1],
            encode_start_timestamp: values[2],
            encode_finish_timestamp: values[3],
            packetizer_finish_timestamp: values[4],
            pacer_exit_timestamp: values[5],
            network_timestamp1: values[6],
            network_timestamp2: values[7],
            receive_start: values[8],
            receive_finish: values[9],
            decode_start: values[10],
            decode_finish: values[11],
            render_time: values[12],
            is_outlier: values[13] > 0,
            is_triggered_by_timer: values[14] > 0,
            ..Default::default()
        };
        timing.encoder_latency_ms = timing.encode_finish_timestamp - timing.encode_start_timestamp;
        timing.packetize_latency_ms =
            timing.packetizer_finish_timestamp - timing.encode_finish_timestamp;
        timing.pacer_latency_ms = timing.pacer_exit_timestamp - timing.packetizer_finish_timestamp;
        timing.capture_to_send_latency_ms = timing.pacer_exit_timestamp - timing.capture_timestamp;
        Some(timing)
    }
}

/// Latency figures for one stats tick, all in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyBreakdown {
    pub rtt_ms: Option<f64>,
    /// Capture to receipt, from `abs-capture-time`
    pub sender_latency_ms: Option<f64>,
    pub average_processing_delay_ms: Option<f64>,
    pub average_jitter_buffer_delay_ms: Option<f64>,
    pub average_decode_latency_ms: Option<f64>,
    pub average_assembly_delay_ms: Option<f64>,
    /// sender + rtt/2 + processing
    pub average_e2e_latency_ms: Option<f64>,
    /// capture-to-send + rtt/2 + processing, from frame timing
    pub frame_timing_e2e_latency_ms: Option<f64>,
    pub frame_timing: Option<FrameTimingInfo>,
}

/// `total / count * 1000`, `None` unless both are known and count is non-zero
fn average_ms(total: Option<f64>, count: Option<f64>) -> Option<f64> {
    match (total, count) {
        (Some(total), Some(count)) if count > 0.0 => Some(total * 1000.0 / count),
        _ => None,
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| *v > 0.0)
}

/// Stateful: the last sender/receiver clock offset is reused when a tick
/// carries no fresh sender report.
#[derive(Debug, Default)]
pub struct LatencyCalculator {
    latest_clock_offset_ms: Option<f64>,
}

impl LatencyCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calculate(&mut self, stats: &StatsSnapshot) -> LatencyBreakdown {
        let mut latency = LatencyBreakdown {
            rtt_ms: Self::rtt_ms(stats),
            ..Default::default()
        };

        if let (Some(rtt), Some(source)) = (latency.rtt_ms, stats.capture_source.as_ref()) {
            latency.sender_latency_ms = self.sender_latency_ms(stats, source, rtt);
        }

        if let Some(video) = stats.inbound_video.as_ref() {
            let frames_decoded = video.frames_decoded.map(|n| n as f64);
            latency.average_processing_delay_ms =
                average_ms(video.total_processing_delay, frames_decoded);
            latency.average_jitter_buffer_delay_ms =
                average_ms(video.jitter_buffer_delay, video.jitter_buffer_emitted_count);
            latency.average_decode_latency_ms = average_ms(video.total_decode_time, frames_decoded);
            latency.average_assembly_delay_ms = average_ms(
                video.total_assembly_time,
                video.frames_assembled_from_multiple_packets,
            );
            latency.frame_timing = video
                .goog_timing_frame_info
                .as_deref()
                .filter(|info| !info.is_empty())
                .and_then(FrameTimingInfo::parse);
        }

        let one_way = positive(latency.rtt_ms).map(|rtt| rtt * 0.5);
        let processing = positive(latency.average_processing_delay_ms);

        if let (Some(sender), Some(one_way), Some(processing)) =
            (positive(latency.sender_latency_ms), one_way, processing)
        {
            latency.average_e2e_latency_ms = Some(sender + one_way + processing);
        }

        if let (Some(timing), Some(one_way), Some(processing)) =
            (latency.frame_timing.as_ref(), one_way, processing)
        {
            latency.frame_timing_e2e_latency_ms =
                Some(timing.capture_to_send_latency_ms as f64 + one_way + processing);
        }

        latency
    }

    /// Selected pair RTT, then the video sender report average, then audio
    fn rtt_ms(stats: &StatsSnapshot) -> Option<f64> {
        if let Some(rtt) = stats
            .active_candidate_pair()
            .and_then(|pair| pair.current_round_trip_time)
        {
            return Some(rtt * 1000.0);
        }

        [&stats.remote_outbound_video, &stats.remote_outbound_audio]
            .into_iter()
            .flatten()
            .find_map(|remote| {
                average_ms(remote.total_round_trip_time, remote.round_trip_time_measurements)
            })
    }

    fn sender_latency_ms(
        &mut self,
        stats: &StatsSnapshot,
        source: &CaptureSource,
        rtt_ms: f64,
    ) -> Option<f64> {
        let sender_capture = source.capture_timestamp + source.sender_capture_time_offset;

        let fresh_offset = stats.remote_outbound_video.as_ref().and_then(|remote| {
            let arrived = remote.timestamp?;
            let sent = remote.remote_timestamp?;
            Some(arrived - (sent + rtt_ms * 0.5))
        });

        let offset = match fresh_offset {
            Some(offset) => {
                self.latest_clock_offset_ms = Some(offset);
                offset
            }
            None => self.latest_clock_offset_ms?,
        };

        let recv_capture = sender_capture + offset - NTP_UNIX_OFFSET_MS;
        Some(source.timestamp - recv_capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::snapshot::{
        CandidatePairStats, InboundRtpStats, RemoteOutboundRtpStats,
    };

    fn base_snapshot() -> StatsSnapshot {
        StatsSnapshot {
            candidate_pairs: vec![CandidatePairStats {
                id: "P1".to_string(),
                selected: true,
                current_round_trip_time: Some(0.04),
                ..Default::default()
            }],
            inbound_video: Some(InboundRtpStats {
                frames_decoded: Some(100),
                total_processing_delay: Some(2.0),
                jitter_buffer_delay: Some(1.5),
                jitter_buffer_emitted_count: Some(100.0),
                total_decode_time: Some(0.5),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn with_capture(mut snapshot: StatsSnapshot) -> StatsSnapshot {
        // Sender clock runs 100 ms ahead of the receiver
        snapshot.remote_outbound_video = Some(RemoteOutboundRtpStats {
            timestamp: Some(1_000_000.0),
            remote_timestamp: Some(1_000_080.0),
            ..Default::default()
        });
        snapshot.capture_source = Some(CaptureSource {
            timestamp: 1_000_050.0,
            capture_timestamp: NTP_UNIX_OFFSET_MS + 1_000_090.0,
            sender_capture_time_offset: 0.0,
        });
        snapshot
    }

    #[test]
    fn test_averages_and_rtt() {
        let mut calculator = LatencyCalculator::new();
        let latency = calculator.calculate(&base_snapshot());

        assert_eq!(latency.rtt_ms, Some(40.0));
        assert_eq!(latency.average_processing_delay_ms, Some(20.0));
        assert_eq!(latency.average_jitter_buffer_delay_ms, Some(15.0));
        assert_eq!(latency.average_decode_latency_ms, Some(5.0));
        assert_eq!(latency.average_assembly_delay_ms, None);
        assert_eq!(latency.sender_latency_ms, None);
        assert_eq!(latency.average_e2e_latency_ms, None);
    }

    #[test]
    fn test_e2e_from_capture_time() {
        let mut calculator = LatencyCalculator::new();
        let latency = calculator.calculate(&with_capture(base_snapshot()));

        // offset = 1_000_000 - (1_000_080 + 20) = -100
        // recv capture = 1_000_090 - 100 = 999_990; sender latency = 60
        assert_eq!(latency.sender_latency_ms, Some(60.0));
        assert_eq!(latency.average_e2e_latency_ms, Some(60.0 + 20.0 + 20.0));
    }

    #[test]
    fn test_clock_offset_is_reused() {
        let mut calculator = LatencyCalculator::new();
        calculator.calculate(&with_capture(base_snapshot()));

        let mut next = with_capture(base_snapshot());
        next.remote_outbound_video = None;
        let latency = calculator.calculate(&next);
        assert_eq!(latency.sender_latency_ms, Some(60.0));
    }

    #[test]
    fn test_e2e_requires_positive_terms() {
        let mut snapshot = with_capture(base_snapshot());
        if let Some(video) = snapshot.inbound_video.as_mut() {
            video.frames_decoded = Some(0);
        }
        let latency = LatencyCalculator::new().calculate(&snapshot);
        assert_eq!(latency.average_processing_delay_ms, None);
        assert_eq!(latency.average_e2e_latency_ms, None);

        let mut snapshot = with_capture(base_snapshot());
        snapshot.candidate_pairs.clear();
        let latency = LatencyCalculator::new().calculate(&snapshot);
        assert_eq!(latency.rtt_ms, None);
        assert_eq!(latency.sender_latency_ms, None);
        assert_eq!(latency.average_e2e_latency_ms, None);
    }

    #[test]
    fn test_rtt_falls_back_to_sender_reports() {
        let mut snapshot = base_snapshot();
        snapshot.candidate_pairs.clear();
        snapshot.remote_outbound_audio = Some(RemoteOutboundRtpStats {
            total_round_trip_time: Some(0.3),
            round_trip_time_measurements: Some(10.0),
            ..Default::default()
        });
        let latency = LatencyCalculator::new().calculate(&snapshot);
        assert!((latency.rtt_ms.unwrap() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_frame_timing() {
        let timing = FrameTimingInfo::parse(
            "1000,100,110,125,127,130,0,0,140,145,146,150,160,1,0",
        )
        .unwrap();
        assert_eq!(timing.encoder_latency_ms, 15);
        assert_eq!(timing.packetize_latency_ms, 2);
        assert_eq!(timing.pacer_latency_ms, 3);
        assert_eq!(timing.capture_to_send_latency_ms, 30);
        assert!(timing.is_outlier);
        assert!(!timing.is_triggered_by_timer);

        assert!(FrameTimingInfo::parse("1,2,3").is_none());

        let mut snapshot = base_snapshot();
        if let Some(video) = snapshot.inbound_video.as_mut() {
            video.goog_timing_frame_info =
                Some("1000,100,110,125,127,130,0,0,140,145,146,150,160,1,0".to_string());
        }
        let latency = LatencyCalculator::new().calculate(&snapshot);
        assert_eq!(latency.frame_timing_e2e_latency_ms, Some(30.0 + 20.0 + 20.0));
        assert_eq!(latency.average_e2e_latency_ms, None);
    }
}
