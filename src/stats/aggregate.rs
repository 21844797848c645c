//! Values derived across consecutive snapshots

use serde::Serialize;

use super::snapshot::{InboundRtpStats, StatsSnapshot};

/// Session-level figures reported alongside the media counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    /// Time since the session connected, `HH:MM:SS`
    pub run_time: String,
    /// Whether this client controls the streamer's input, if it said so yet
    pub controls_stream_input: Option<bool>,
    /// Encoder quantisation parameter, `-1` when unknown
    pub video_encoder_avg_qp: i32,
}

/// Snapshot plus derived rates
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsView {
    pub snapshot: StatsSnapshot,
    /// kbit/s
    pub video_bitrate: Option<u64>,
    /// kbit/s
    pub audio_bitrate: Option<u64>,
    /// Percentage of video packets lost
    pub video_packet_loss: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub session: SessionStats,
}

/// `floor(8 * Δbytes / Δms)` when both bytes and timestamp strictly advanced
pub fn bitrate_kbps(previous: Option<&InboundRtpStats>, current: Option<&InboundRtpStats>) -> Option<u64> {
    let previous = previous?;
    let current = current?;
    let (prev_bytes, bytes) = (previous.bytes_received?, current.bytes_received?);
    let (prev_ts, ts) = (previous.timestamp?, current.timestamp?);

    if bytes > prev_bytes && ts > prev_ts {
        Some((8.0 * (bytes - prev_bytes) as f64 / (ts - prev_ts)).floor() as u64)
    } else {
        None
    }
}

fn packet_loss(stats: &InboundRtpStats) -> Option<f64> {
    let lost = stats.packets_lost?.max(0.0);
    let total = stats.packets_received? as f64 + lost;
    (total > 0.0).then(|| lost * 100.0 / total)
}

impl StatsView {
    /// Derive a view from the current snapshot and the previous view
    ///
    /// Bitrates are omitted unless bytes and timestamp both advanced since the
    /// previous snapshot.
    pub fn derive(previous: Option<&StatsView>, snapshot: StatsSnapshot, session: SessionStats) -> Self {
        let prev_snapshot = previous.map(|v| &v.snapshot);

        let video_bitrate = bitrate_kbps(
            prev_snapshot.and_then(|s| s.inbound_video.as_ref()),
            snapshot.inbound_video.as_ref(),
        );
        let audio_bitrate = bitrate_kbps(
            prev_snapshot.and_then(|s| s.inbound_audio.as_ref()),
            snapshot.inbound_audio.as_ref(),
        );

        Self {
            video_bitrate,
            audio_bitrate,
            video_packet_loss: snapshot.inbound_video.as_ref().and_then(packet_loss),
            video_codec: snapshot.inbound_video_codec(),
            audio_codec: snapshot.inbound_audio_codec(),
            snapshot,
            session,
        }
    }
}

/// Format a duration in seconds as `HH:MM:SS`
pub fn format_run_time(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        (seconds / 3600) % 24,
        (seconds / 60) % 60,
        seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(bytes: u64, timestamp: f64) -> StatsSnapshot {
        StatsSnapshot {
            inbound_video: Some(InboundRtpStats {
                bytes_received: Some(bytes),
                timestamp: Some(timestamp),
                packets_received: Some(95),
                packets_lost: Some(5.0),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_bitrate_requires_progress() {
        let first = StatsView::derive(None, video(10_000, 1_000.0), SessionStats::default());
        assert_eq!(first.video_bitrate, None);

        let second = StatsView::derive(Some(&first), video(135_000, 2_000.0), SessionStats::default());
        assert_eq!(second.video_bitrate, Some(1_000));

        // Stalled stream: bytes unchanged
        let stalled = StatsView::derive(Some(&second), video(135_000, 3_000.0), SessionStats::default());
        assert_eq!(stalled.video_bitrate, None);

        // Counter reset never goes negative
        let third = StatsView::derive(Some(&stalled), video(500, 4_000.0), SessionStats::default());
        assert_eq!(third.video_bitrate, None);

        // Same timestamp: no division
        let fourth = StatsView::derive(Some(&third), video(900_000, 4_000.0), SessionStats::default());
        assert_eq!(fourth.video_bitrate, None);
        assert_eq!(fourth.audio_bitrate, None);

        let fifth = StatsView::derive(Some(&fourth), video(1_025_000, 5_000.0), SessionStats::default());
        assert_eq!(fifth.video_bitrate, Some(1_000));
    }

    #[test]
    fn test_packet_loss() {
        let view = StatsView::derive(None, video(1, 1.0), SessionStats::default());
        assert_eq!(view.video_packet_loss, Some(5.0));
    }

    #[test]
    fn test_format_run_time() {
        assert_eq!(format_run_time(0), "00:00:00");
        assert_eq!(format_run_time(3_725), "01:02:05");
        assert_eq!(format_run_time(-4), "00:00:00");
    }
}
