use std::time::{Duration, Instant};

use crate::config::SyncConfig;
use crate::media::MediaKind;

/// Maps presentation timestamps onto wall-clock sleeps
///
/// The first timestamp seen after construction or `reset()` becomes the
/// reference point together with the wall time it was seen at. Later
/// timestamps are scheduled relative to that pair.
#[derive(Debug, Clone)]
pub struct MediaClock {
    reference: Option<(i64, Instant)>,
    video_tolerance: Duration,
    audio_tolerance: Duration,
}

impl MediaClock {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            reference: None,
            video_tolerance: config.video_tolerance,
            audio_tolerance: config.audio_tolerance,
        }
    }

    /// How long to sleep before presenting `timestamp` (µs)
    pub fn sleep_time(&mut self, timestamp: i64, kind: MediaKind) -> Duration {
        self.sleep_time_at(timestamp, kind, Instant::now())
    }

    pub(crate) fn sleep_time_at(&mut self, timestamp: i64, kind: MediaKind, now: Instant) -> Duration {
        let Some((reference_ts, reference_wall)) = self.reference else {
            self.reference = Some((timestamp, now));
            return Duration::ZERO;
        };

        let stream_elapsed_ms = ceil_millis(timestamp.saturating_sub(reference_ts));
        let tolerance = match kind {
            MediaKind::Video => self.video_tolerance,
            MediaKind::Audio => self.audio_tolerance,
        };
        let wall_elapsed_ms = (now.saturating_duration_since(reference_wall).as_millis() as i64)
            .saturating_add(tolerance.as_millis() as i64);

        let ahead_ms = stream_elapsed_ms.saturating_sub(wall_elapsed_ms);
        if ahead_ms > 0 {
            Duration::from_millis(ahead_ms as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Forget the reference; the next timestamp re-anchors the clock
    pub fn reset(&mut self) {
        self.reference = None;
    }

    pub fn is_anchored(&self) -> bool {
        self.reference.is_some()
    }
}

/// µs to ms, rounding towards positive infinity
fn ceil_millis(micros: i64) -> i64 {
    if micros > 0 {
        micros.saturating_add(999) / 1000
    } else {
        micros / 1000
    }
}
