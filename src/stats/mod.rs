//! Statistics and latency pipeline
//!
//! Once per second while connected the controller pulls [`RawStats`] from
//! the media session and feeds them through [`StatsPipeline::process`]:
//!
//! ```text
//! RawStats -> StatsSnapshot -> StatsView (bitrates, codecs, session)
//!                           -> LatencyBreakdown
//! ```

pub mod aggregate;
pub mod latency;
pub mod snapshot;

pub use aggregate::{SessionStats, StatsView};
pub use latency::{FrameTimingInfo, LatencyBreakdown, LatencyCalculator};
pub use snapshot::{RawStats, RawStatsEntry, StatsSnapshot};

use chrono::{DateTime, Utc};

/// Result of one stats tick
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub view: StatsView,
    pub latency: LatencyBreakdown,
}

/// Session values the pipeline reports but does not own
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub connected_at: DateTime<Utc>,
    pub controls_stream_input: Option<bool>,
    pub avg_qp: i32,
}

/// Per-session pipeline state
#[derive(Debug, Default)]
pub struct StatsPipeline {
    previous: Option<StatsView>,
    latency: LatencyCalculator,
}

impl StatsPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, raw: &RawStats, session: SessionInfo) -> StatsReport {
        let snapshot = StatsSnapshot::from_raw(raw);
        let latency = self.latency.calculate(&snapshot);

        let run_time = (Utc::now() - session.connected_at).num_seconds();
        let session_stats = SessionStats {
            run_time: aggregate::format_run_time(run_time),
            controls_stream_input: session.controls_stream_input,
            video_encoder_avg_qp: session.avg_qp,
        };

        let view = StatsView::derive(self.previous.as_ref(), snapshot, session_stats);
        self.previous = Some(view.clone());

        StatsReport { view, latency }
    }

    /// Drop history, e.g. when a new session starts
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(bytes: u64, timestamp: f64) -> RawStats {
        RawStats {
            entries: vec![
                RawStatsEntry::new(
                    "IV",
                    "inbound-rtp",
                    json!({
                        "kind": "video",
                        "timestamp": timestamp,
                        "bytesReceived": bytes,
                        "codecId": "C96",
                        "framesDecoded": 10,
                        "totalProcessingDelay": 0.1
                    }),
                ),
                RawStatsEntry::new("C96", "codec", json!({"mimeType": "video/VP8"})),
                RawStatsEntry::new(
                    "CP",
                    "candidate-pair",
                    json!({"selected": true, "currentRoundTripTime": 0.01}),
                ),
            ],
        }
    }

    #[test]
    fn test_pipeline_tracks_previous_tick() {
        let mut pipeline = StatsPipeline::new();
        let session = SessionInfo {
            connected_at: Utc::now(),
            controls_stream_input: Some(true),
            avg_qp: 23,
        };

        let first = pipeline.process(&raw(1_000, 1_700_000_000_000.0), session);
        assert_eq!(first.view.video_bitrate, None);
        assert_eq!(first.view.video_codec.as_deref(), Some("VP8"));
        assert_eq!(first.view.session.video_encoder_avg_qp, 23);
        assert_eq!(first.latency.rtt_ms, Some(10.0));
        assert_eq!(first.latency.average_processing_delay_ms, Some(10.0));

        let second = pipeline.process(&raw(126_000, 1_700_000_001_000.0), session);
        assert_eq!(second.view.video_bitrate, Some(1_000));

        pipeline.reset();
        let third = pipeline.process(&raw(200_000, 1_700_000_002_000.0), session);
        assert_eq!(third.view.video_bitrate, None);
    }
}
