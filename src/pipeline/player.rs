use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{WorkerControl, WorkerTask};
use crate::audio::AudioQueue;
use crate::player::PlaybackListener;
use crate::sync::{Dequeued, MediaClock, Payload, PlaybackBuffer};

/// Registered frame/state listeners
pub type ListenerList = Arc<RwLock<Vec<Arc<dyn PlaybackListener>>>>;

/// Dispatch counters shared with the facade
#[derive(Debug, Default)]
pub struct DispatchCounters {
    pub video_frames: AtomicU64,
    pub audio_blocks: AtomicU64,

    /// Payloads abandoned because a pause/stop interrupted their sleep
    pub dropped: AtomicU64,

    /// Most recent synchronization sleep, in microseconds
    pub last_sleep_us: AtomicU64,
}

/// Snapshot of `DispatchCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub video_frames: u64,
    pub audio_blocks: u64,
    pub dropped: u64,
    pub last_sleep: Duration,
}

impl DispatchCounters {
    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_blocks: self.audio_blocks.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            last_sleep: Duration::from_micros(self.last_sleep_us.load(Ordering::Relaxed)),
        }
    }
}

/// Consumer stage: paces buffered payloads against the media clock and
/// dispatches them
pub struct PlayerStage {
    buffer: Arc<PlaybackBuffer>,
    audio: Arc<AudioQueue>,
    listeners: ListenerList,
    counters: Arc<DispatchCounters>,
    clock: MediaClock,
    max_sleep: Duration,
    segment: Option<u64>,
}

impl PlayerStage {
    pub fn new(
        buffer: Arc<PlaybackBuffer>,
        audio: Arc<AudioQueue>,
        listeners: ListenerList,
        counters: Arc<DispatchCounters>,
        clock: MediaClock,
        max_sleep: Duration,
    ) -> Self {
        Self {
            buffer,
            audio,
            listeners,
            counters,
            clock,
            max_sleep,
            segment: None,
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn PlaybackListener>> {
        self.listeners.read().clone()
    }
}

impl WorkerTask for PlayerStage {
    fn execute_task(&mut self, control: &WorkerControl) {
        let (payload, segment) = match self.buffer.pop_ready(|| control.is_interrupted()) {
            Dequeued::Payload { payload, segment } => (payload, segment),
            Dequeued::EndOfStream => {
                tracing::info!("Playback finished");
                for listener in self.listeners() {
                    listener.on_finished();
                }
                return;
            }
            Dequeued::Interrupted => return,
        };

        if self.segment != Some(segment) {
            // Buffer was flushed or drained since the last payload
            self.clock.reset();
            self.segment = Some(segment);
        }

        let sleep = self
            .clock
            .sleep_time(payload.timestamp(), payload.kind())
            .min(self.max_sleep);
        self.counters
            .last_sleep_us
            .store(sleep.as_micros() as u64, Ordering::Relaxed);

        if !control.sleep(sleep) {
            tracing::debug!(
                "Dropped {:?} payload at {}us: interrupted while waiting {:?}",
                payload.kind(),
                payload.timestamp(),
                sleep
            );
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match payload.into_payload() {
            Payload::Video(frame) => {
                for listener in self.listeners() {
                    listener.on_video_frame(&frame);
                }
                self.counters.video_frames.fetch_add(1, Ordering::Relaxed);
            }
            Payload::Audio(block) => {
                self.audio.enqueue(block);
                self.counters.audio_blocks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_resume(&mut self) {
        self.clock.reset();
    }
}
