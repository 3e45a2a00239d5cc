use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::TimedPayload;
use crate::config::BufferConfig;
use crate::media::MediaKind;

/// Buffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub pushed: u64,
    pub popped: u64,

    /// Entries discarded by the hard-max safety valve
    pub dropped: u64,

    /// Entries discarded by `flush`/`drain`
    pub flushed: u64,

    pub video_count: usize,
    pub audio_count: usize,
}

/// Outcome of a blocking consumer dequeue
#[derive(Debug)]
pub enum Dequeued {
    Payload {
        payload: TimedPayload,

        /// Playback segment the payload belongs to; advances on every flush
        segment: u64,
    },

    /// The producer marked end of stream and everything has been handed out
    EndOfStream,

    /// The caller's interrupt predicate fired while waiting
    Interrupted,
}

/// Outcome of waiting for a consumer to catch up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
    /// Everything was consumed and the queue has been reset
    Emptied,

    /// The deadline passed; leftovers were discarded
    TimedOut,

    /// The caller gave up first; nothing was discarded
    Interrupted,
}

struct BufferState {
    entries: BTreeMap<(i64, u64), TimedPayload>,
    next_seq: u64,
    video_count: usize,
    audio_count: usize,
    has_video: bool,
    has_audio: bool,
    draining: bool,
    end_of_stream: bool,
    end_reported: bool,
    segment: u64,
    stats: BufferStats,
}

impl BufferState {
    fn insert(&mut self, payload: TimedPayload) {
        match payload.kind() {
            MediaKind::Video => self.video_count += 1,
            MediaKind::Audio => self.audio_count += 1,
        }
        let key = (payload.timestamp(), self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, payload);
        self.stats.pushed += 1;
    }

    fn pop_first(&mut self) -> Option<TimedPayload> {
        let (_, payload) = self.entries.pop_first()?;
        match payload.kind() {
            MediaKind::Video => self.video_count -= 1,
            MediaKind::Audio => self.audio_count -= 1,
        }
        Some(payload)
    }

    fn clear(&mut self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        self.video_count = 0;
        self.audio_count = 0;
        self.stats.flushed += cleared as u64;
        self.draining = false;
        self.end_of_stream = false;
        self.end_reported = false;
        self.segment += 1;
        cleared
    }

    fn is_full(&self, limits: &BufferConfig) -> bool {
        if self.has_video {
            self.video_count >= limits.soft_max_video
                && (!self.has_audio || self.audio_count >= limits.target_audio)
        } else {
            self.has_audio && self.audio_count >= limits.soft_max_audio_only
        }
    }

    fn is_ready(&self, limits: &BufferConfig, relaxed: bool) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        if relaxed {
            (self.has_video && self.video_count > 0) || (self.has_audio && self.audio_count > 0)
        } else {
            (!self.has_video || self.video_count >= limits.target_video)
                && (!self.has_audio || self.audio_count >= limits.target_audio)
        }
    }
}

/// Bounded, timestamp-ordered queue between the reader and player stages
///
/// Every entry is keyed by `(timestamp, insertion sequence)`, so dequeue
/// order is ascending timestamp with ties in arrival order. All state sits
/// behind one mutex and one condition variable; every mutation wakes all
/// waiters, which re-check their own predicate.
pub struct PlaybackBuffer {
    limits: BufferConfig,
    safety_wait: Duration,
    state: Mutex<BufferState>,
    changed: Condvar,
}

impl PlaybackBuffer {
    /// Create a new playback buffer
    ///
    /// # Arguments
    /// * `limits` - Target / soft / hard thresholds
    /// * `safety_wait` - Upper bound on any single condition wait, a safety
    ///   net against missed wakeups
    pub fn new(limits: BufferConfig, safety_wait: Duration) -> Self {
        Self {
            limits,
            safety_wait,
            state: Mutex::new(BufferState {
                entries: BTreeMap::new(),
                next_seq: 0,
                video_count: 0,
                audio_count: 0,
                has_video: false,
                has_audio: false,
                draining: false,
                end_of_stream: false,
                end_reported: false,
                segment: 0,
                stats: BufferStats::default(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Declare which kinds the current session produces; clears the buffer
    pub fn configure(&self, has_video: bool, has_audio: bool) {
        let mut state = self.state.lock();
        state.clear();
        state.has_video = has_video;
        state.has_audio = has_audio;
        drop(state);
        self.changed.notify_all();
    }

    /// Insert without waiting for space
    ///
    /// A video payload arriving while `video_count` is at the hard maximum
    /// first evicts the oldest entries until there is room for it.
    pub fn push(&self, payload: TimedPayload) {
        let mut state = self.state.lock();
        self.insert_locked(&mut state, payload);
        drop(state);
        self.changed.notify_all();
    }

    /// Insert once the producer is no longer over its limit
    ///
    /// Returns the payload back if `interrupted` fires while waiting.
    pub fn push_blocking(
        &self,
        payload: TimedPayload,
        interrupted: impl Fn() -> bool,
    ) -> Result<(), TimedPayload> {
        let mut state = self.state.lock();
        loop {
            if interrupted() {
                return Err(payload);
            }
            if !state.is_full(&self.limits) {
                break;
            }
            self.changed.wait_for(&mut state, self.safety_wait);
        }
        self.insert_locked(&mut state, payload);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn insert_locked(&self, state: &mut BufferState, payload: TimedPayload) {
        if payload.kind() == MediaKind::Video {
            while state.video_count >= self.limits.hard_max_video {
                let Some(oldest) = state.pop_first() else {
                    break;
                };
                state.stats.dropped += 1;
                tracing::warn!(
                    "Playback buffer at hard max ({} video), dropped {:?} payload at {}us",
                    self.limits.hard_max_video,
                    oldest.kind(),
                    oldest.timestamp()
                );
            }
        }
        state.insert(payload);
    }

    /// True when the producer should stop and wait for the consumer
    pub fn is_full_for_producer(&self) -> bool {
        self.state.lock().is_full(&self.limits)
    }

    /// True when enough data is buffered to hand out the next payload
    ///
    /// With `draining` set, any queued data of an expected kind is enough.
    pub fn is_ready_for_consumer(&self, draining: bool) -> bool {
        self.state.lock().is_ready(&self.limits, draining)
    }

    /// Remove the lowest-timestamp entry regardless of readiness
    pub fn pop(&self) -> Option<TimedPayload> {
        let mut state = self.state.lock();
        let payload = state.pop_first();
        if payload.is_some() {
            state.stats.popped += 1;
        }
        drop(state);
        self.changed.notify_all();
        payload
    }

    /// Block until the buffer is ready, then remove the lowest-timestamp entry
    pub fn pop_ready(&self, interrupted: impl Fn() -> bool) -> Dequeued {
        let mut state = self.state.lock();
        loop {
            if interrupted() {
                return Dequeued::Interrupted;
            }

            let relaxed = state.draining || state.end_of_stream;
            if state.is_ready(&self.limits, relaxed)
                && let Some(payload) = state.pop_first()
            {
                state.stats.popped += 1;
                let segment = state.segment;
                drop(state);
                self.changed.notify_all();
                return Dequeued::Payload { payload, segment };
            }

            if state.end_of_stream && state.entries.is_empty() && !state.end_reported {
                state.end_reported = true;
                return Dequeued::EndOfStream;
            }

            self.changed.wait_for(&mut state, self.safety_wait);
        }
    }

    /// Let the consumer empty the buffer under relaxed readiness, then
    /// discard whatever is left once `timeout` runs out
    ///
    /// Returns true if the consumer emptied the buffer in time.
    pub fn drain(&self, timeout: Duration) -> bool {
        self.drain_until(timeout, || false) == Drained::Emptied
    }

    /// `drain` that gives up as soon as `interrupted` fires
    ///
    /// An interrupted drain leaves the queued entries in place (readiness
    /// stays relaxed) so the caller can retry later.
    pub fn drain_until(&self, timeout: Duration, interrupted: impl Fn() -> bool) -> Drained {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.draining = true;
        self.changed.notify_all();

        let mut outcome = Drained::Emptied;
        while !state.entries.is_empty() {
            if interrupted() {
                tracing::debug!(
                    "Playback buffer drain interrupted with {} entries left",
                    state.entries.len()
                );
                return Drained::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                outcome = Drained::TimedOut;
                break;
            }
            let wait = self.safety_wait.min(deadline - now);
            self.changed.wait_for(&mut state, wait);
        }

        let leftover = state.clear();
        drop(state);
        self.changed.notify_all();

        if outcome == Drained::Emptied {
            tracing::debug!("Playback buffer drained");
        } else {
            tracing::warn!("Playback buffer drain timed out, discarded {} entries", leftover);
        }
        outcome
    }

    /// Discard everything and start a new playback segment
    pub fn flush(&self) {
        let cleared = self.state.lock().clear();
        self.changed.notify_all();
        tracing::debug!("Playback buffer flushed ({} entries)", cleared);
    }

    /// The producer has nothing more for this segment
    pub fn mark_end_of_stream(&self) {
        self.state.lock().end_of_stream = true;
        self.changed.notify_all();
    }

    /// Wake every waiter so it re-checks its interrupt predicate
    pub fn wake_all(&self) {
        // Taking the lock orders this wakeup after any waiter's predicate check
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn video_count(&self) -> usize {
        self.state.lock().video_count
    }

    pub fn audio_count(&self) -> usize {
        self.state.lock().audio_count
    }

    pub fn segment(&self) -> u64 {
        self.state.lock().segment
    }

    /// Timestamps currently queued, in dequeue order
    pub fn timestamps(&self) -> Vec<i64> {
        self.state.lock().entries.keys().map(|(ts, _)| *ts).collect()
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        BufferStats {
            video_count: state.video_count,
            audio_count: state.audio_count,
            ..state.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioBlock, AudioFormat, SampleFormat};
    use crate::video::{PixelFormat, VideoFrame};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn video(pts: i64) -> TimedPayload {
        TimedPayload::video(VideoFrame::new(pts, 2, 2, PixelFormat::RGBA, vec![0u8; 16]))
    }

    fn audio(pts: i64) -> TimedPayload {
        TimedPayload::audio(AudioBlock::new(
            pts,
            AudioFormat::new(48000, 2, SampleFormat::S16),
            vec![0u8; 64],
        ))
    }

    fn buffer(has_video: bool, has_audio: bool) -> PlaybackBuffer {
        let buffer = PlaybackBuffer::new(BufferConfig::default(), Duration::from_millis(100));
        buffer.configure(has_video, has_audio);
        buffer
    }

    #[test]
    fn test_hard_max_drops_oldest() {
        let buffer = buffer(true, false);
        for i in 0..25 {
            buffer.push(video(i * 1000));
            assert!(buffer.video_count() <= 20);
        }

        assert_eq!(buffer.len(), 20);
        let timestamps = buffer.timestamps();
        assert_eq!(timestamps.first(), Some(&5000));
        assert_eq!(timestamps.last(), Some(&24000));
        assert_eq!(buffer.stats().dropped, 5);
    }

    #[test]
    fn test_hard_max_holds_with_older_audio() {
        let buffer = buffer(true, true);
        buffer.push(audio(0));
        buffer.push(audio(1));
        for i in 0..20 {
            buffer.push(video(10 + i));
        }
        assert_eq!(buffer.video_count(), 20);

        buffer.push(video(100));
        assert_eq!(buffer.video_count(), 20);
        assert_eq!(buffer.audio_count(), 0);
        assert_eq!(buffer.stats().dropped, 3);
    }

    #[test]
    fn test_readiness_needs_target_video() {
        let buffer = buffer(true, true);
        for i in 0..3 {
            buffer.push(audio(i * 1000));
        }
        buffer.push(video(0));
        buffer.push(video(1000));
        assert!(!buffer.is_ready_for_consumer(false));
        assert!(buffer.is_ready_for_consumer(true));

        buffer.push(video(2000));
        assert!(buffer.is_ready_for_consumer(false));
    }

    #[test]
    fn test_producer_full_predicate() {
        let buffer = buffer(true, true);
        for i in 0..5 {
            buffer.push(video(i));
        }
        // Audio still short: keep reading so audio can catch up
        assert!(!buffer.is_full_for_producer());
        for i in 0..3 {
            buffer.push(audio(i));
        }
        assert!(buffer.is_full_for_producer());

        let video_only = self::buffer(true, false);
        for i in 0..4 {
            video_only.push(video(i));
        }
        assert!(!video_only.is_full_for_producer());
        video_only.push(video(4));
        assert!(video_only.is_full_for_producer());
    }

    #[test]
    fn test_pop_orders_by_timestamp() {
        let buffer = buffer(true, true);
        buffer.push(video(3000));
        buffer.push(audio(1000));
        buffer.push(video(1000));
        buffer.push(audio(2000));

        let order: Vec<_> = std::iter::from_fn(|| buffer.pop())
            .map(|p| (p.timestamp(), p.kind()))
            .collect();
        assert_eq!(
            order,
            vec![
                (1000, MediaKind::Audio),
                (1000, MediaKind::Video),
                (2000, MediaKind::Audio),
                (3000, MediaKind::Video),
            ]
        );
        assert_eq!(buffer.video_count(), 0);
        assert_eq!(buffer.audio_count(), 0);
    }

    #[test]
    fn test_push_blocking_waits_for_consumer() {
        let buffer = Arc::new(buffer(true, false));
        for i in 0..5 {
            buffer.push(video(i * 1000));
        }

        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.push_blocking(video(5000), || false).is_ok())
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(buffer.len(), 5);

        assert_eq!(buffer.pop().map(|p| p.timestamp()), Some(0));
        assert!(producer.join().unwrap());
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.timestamps().last(), Some(&5000));
    }

    #[test]
    fn test_push_blocking_interrupt_returns_payload() {
        let buffer = Arc::new(buffer(true, false));
        for i in 0..5 {
            buffer.push(video(i));
        }
        let stop = Arc::new(AtomicBool::new(false));

        let producer = {
            let buffer = buffer.clone();
            let stop = stop.clone();
            thread::spawn(move || buffer.push_blocking(video(99), || stop.load(Ordering::SeqCst)))
        };

        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::SeqCst);
        buffer.wake_all();

        let returned = producer.join().unwrap().unwrap_err();
        assert_eq!(returned.timestamp(), 99);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_end_of_stream_relaxes_and_reports_once() {
        let buffer = buffer(true, false);
        buffer.push(video(0));
        buffer.mark_end_of_stream();

        assert!(matches!(buffer.pop_ready(|| false), Dequeued::Payload { .. }));
        assert!(matches!(buffer.pop_ready(|| false), Dequeued::EndOfStream));

        // Second report only after a flush started a new segment
        let calls = AtomicBool::new(false);
        let outcome = buffer.pop_ready(|| calls.swap(true, Ordering::SeqCst));
        assert!(matches!(outcome, Dequeued::Interrupted));
    }

    #[test]
    fn test_drain_waits_for_consumer() {
        let buffer = Arc::new(buffer(true, true));
        buffer.push(video(0));
        buffer.push(audio(0));
        let segment = buffer.segment();

        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut popped = 0;
                while popped < 2 {
                    if let Dequeued::Payload { .. } = buffer.pop_ready(|| false) {
                        popped += 1;
                    }
                }
                popped
            })
        };

        assert!(buffer.drain(Duration::from_secs(2)));
        assert_eq!(consumer.join().unwrap(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.segment(), segment + 1);
    }

    #[test]
    fn test_drain_times_out_and_flushes() {
        let buffer = buffer(true, false);
        buffer.push(video(0));

        let start = Instant::now();
        assert!(!buffer.drain(Duration::from_millis(150)));
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().flushed, 1);
    }

    #[test]
    fn test_interrupted_drain_keeps_entries() {
        let buffer = Arc::new(buffer(true, false));
        buffer.push(video(800_000));
        buffer.push(video(900_000));

        let stop = Arc::new(AtomicBool::new(false));
        let drainer = {
            let buffer = buffer.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                buffer.drain_until(Duration::from_secs(5), || stop.load(Ordering::SeqCst))
            })
        };
        thread::sleep(Duration::from_millis(30));
        stop.store(true, Ordering::SeqCst);
        buffer.wake_all();

        assert_eq!(drainer.join().unwrap(), Drained::Interrupted);
        assert_eq!(buffer.timestamps(), vec![800_000, 900_000]);
        assert_eq!(buffer.stats().flushed, 0);

        // Readiness stays relaxed for the tail
        assert!(matches!(buffer.pop_ready(|| false), Dequeued::Payload { .. }));
    }

    #[test]
    fn test_flush_is_idempotent() {
        let buffer = buffer(true, true);
        buffer.push(video(0));
        buffer.push(audio(0));

        buffer.flush();
        buffer.flush();
        assert!(buffer.is_empty());
        assert_eq!(buffer.video_count(), 0);
        assert_eq!(buffer.audio_count(), 0);
    }
}
