use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{WorkerControl, WorkerTask};
use crate::audio::{AudioBlock, AudioQueue, StereoDownmixer};
use crate::media::{MediaInfo, MediaKind, MediaSource, Packet};
use crate::sync::{Drained, PlaybackBuffer, TimedPayload};

/// Shared slot holding the current session's container + decoders
pub type SourceSlot = Arc<Mutex<Option<Box<dyn MediaSource>>>>;

/// Consecutive read failures after which the stream is treated as ended
const MAX_READ_ERRORS: u32 = 32;

/// Requests from the facade to the reader thread
#[derive(Debug, Default)]
pub struct ReaderShared {
    /// Seek back to the start on the next iteration
    pub rewind: AtomicBool,

    /// A new source was installed; forget all per-session state
    pub new_session: AtomicBool,

    /// Restart from the beginning at end of stream instead of finishing
    pub looped: AtomicBool,

    /// Decode the audio stream (false when audio output is disabled)
    pub audio_enabled: AtomicBool,
}

/// Per-kind timestamp bookkeeping
#[derive(Debug, Clone, Copy, Default)]
struct KindTimes {
    video: Option<i64>,
    audio: Option<i64>,
}

impl KindTimes {
    fn get(&self, kind: MediaKind) -> Option<i64> {
        match kind {
            MediaKind::Video => self.video,
            MediaKind::Audio => self.audio,
        }
    }

    fn set(&mut self, kind: MediaKind, value: Option<i64>) {
        match kind {
            MediaKind::Video => self.video = value,
            MediaKind::Audio => self.audio = value,
        }
    }
}

/// Producer stage: reads packets, decodes them and fills the playback buffer
pub struct ReaderStage {
    source: SourceSlot,
    buffer: Arc<PlaybackBuffer>,
    audio: Arc<AudioQueue>,
    shared: Arc<ReaderShared>,
    drain_timeout: Duration,

    /// Decoded payloads not yet accepted by the buffer
    pending: VecDeque<TimedPayload>,
    last_pushed: KindTimes,

    /// Highest timestamps queued before the last seek; decoder output above
    /// them is pre-seek leftovers
    end_markers: KindTimes,

    /// Source exhausted; end handling runs once `pending` is in the buffer
    at_end: bool,
    finished: bool,
    read_errors: u32,
}

impl ReaderStage {
    pub fn new(
        source: SourceSlot,
        buffer: Arc<PlaybackBuffer>,
        audio: Arc<AudioQueue>,
        shared: Arc<ReaderShared>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            source,
            buffer,
            audio,
            shared,
            drain_timeout,
            pending: VecDeque::new(),
            last_pushed: KindTimes::default(),
            end_markers: KindTimes::default(),
            at_end: false,
            finished: false,
            read_errors: 0,
        }
    }

    /// Hand pending payloads to the buffer. Returns false if interrupted.
    fn flush_pending(&mut self, control: &WorkerControl) -> bool {
        while let Some(payload) = self.pending.pop_front() {
            if let Err(payload) = self.buffer.push_blocking(payload, || control.is_interrupted()) {
                self.pending.push_front(payload);
                return false;
            }
        }
        true
    }

    fn reset_session(&mut self) {
        self.pending.clear();
        self.last_pushed = KindTimes::default();
        self.end_markers = KindTimes::default();
        self.at_end = false;
        self.finished = false;
        self.read_errors = 0;
    }

    /// Seek every active stream to the start and arm the stale-output filter
    fn rewind(&mut self) {
        self.pending.clear();
        self.end_markers = self.last_pushed;
        self.last_pushed = KindTimes::default();
        self.at_end = false;
        self.finished = false;
        self.read_errors = 0;

        let source_slot = self.source.clone();
        let mut slot = source_slot.lock();
        let Some(source) = slot.as_mut() else {
            return;
        };
        for stream_index in source.info().active_streams() {
            if let Err(e) = source.seek(stream_index, 0) {
                tracing::warn!("Failed to seek stream {} to start: {}", stream_index, e);
            }
        }
        tracing::debug!(
            "Reader rewound (end markers: video {:?}, audio {:?})",
            self.end_markers.video,
            self.end_markers.audio
        );
    }

    /// Finish or loop the item. A pause during the loop drain leaves
    /// `at_end` set so the drain is retried after resume.
    fn on_stream_end(&mut self, control: &WorkerControl) {
        if !self.shared.looped.load(Ordering::SeqCst) {
            tracing::info!("End of stream");
            self.buffer.mark_end_of_stream();
            self.at_end = false;
            self.finished = true;
            return;
        }

        // Let the player present the tail before starting over
        if self.buffer.drain_until(self.drain_timeout, || control.is_interrupted())
            == Drained::Interrupted
            || self.audio.drain_until(self.drain_timeout, || control.is_interrupted())
                == Drained::Interrupted
        {
            tracing::debug!("Loop drain interrupted, retrying after resume");
            return;
        }
        tracing::info!("End of stream, looping");
        self.rewind();
    }

    fn decode(
        &self,
        source: &mut dyn MediaSource,
        info: &MediaInfo,
        packet: &Packet,
    ) -> Vec<TimedPayload> {
        match info.kind_of(packet.stream_index) {
            Some(MediaKind::Video) => match source.decode_video(packet) {
                Ok(frames) => frames.into_iter().map(TimedPayload::video).collect(),
                Err(e) => {
                    tracing::warn!("Video decode failed at {}us: {}", packet.pts, e);
                    Vec::new()
                }
            },
            Some(MediaKind::Audio) if self.shared.audio_enabled.load(Ordering::Relaxed) => {
                match source.decode_audio(packet) {
                    Ok(blocks) => to_stereo(&blocks),
                    Err(e) => {
                        tracing::warn!("Audio decode failed at {}us: {}", packet.pts, e);
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        }
    }

    /// Output the decoders were still holding when the container ran out
    fn decoder_tail(&self, source: &mut dyn MediaSource, info: &MediaInfo) -> Vec<TimedPayload> {
        let mut tail = Vec::new();
        if info.has_video() {
            match source.flush_video() {
                Ok(frames) => tail.extend(frames.into_iter().map(TimedPayload::video)),
                Err(e) => tracing::warn!("Video decoder flush failed: {}", e),
            }
        }
        if info.has_audio() && self.shared.audio_enabled.load(Ordering::Relaxed) {
            match source.flush_audio() {
                Ok(blocks) => tail.extend(to_stereo(&blocks)),
                Err(e) => tracing::warn!("Audio decoder flush failed: {}", e),
            }
        }
        tail
    }

    /// Filter stale and out-of-order output, then queue for the buffer
    fn accept(&mut self, payload: TimedPayload) {
        let kind = payload.kind();
        let timestamp = payload.timestamp();

        if let Some(marker) = self.end_markers.get(kind) {
            if timestamp > marker {
                tracing::debug!(
                    "Discarding stale {:?} payload at {}us (end marker {}us)",
                    kind,
                    timestamp,
                    marker
                );
                return;
            }
            self.end_markers.set(kind, None);
        }

        if let Some(last) = self.last_pushed.get(kind)
            && timestamp < last
        {
            tracing::debug!(
                "Discarding out-of-order {:?} payload at {}us (last {}us)",
                kind,
                timestamp,
                last
            );
            return;
        }

        self.last_pushed.set(kind, Some(timestamp));
        self.pending.push_back(payload);
    }
}

fn to_stereo(blocks: &[AudioBlock]) -> Vec<TimedPayload> {
    blocks
        .iter()
        .filter_map(|block| match StereoDownmixer::downmix(block) {
            Ok(stereo) => Some(TimedPayload::audio(stereo)),
            Err(e) => {
                tracing::warn!("Dropping audio block at {}us: {}", block.pts, e);
                None
            }
        })
        .collect()
}

impl WorkerTask for ReaderStage {
    fn execute_task(&mut self, control: &WorkerControl) {
        if self.shared.new_session.swap(false, Ordering::SeqCst) {
            self.reset_session();
        }
        if self.shared.rewind.swap(false, Ordering::SeqCst) {
            self.rewind();
        }
        if self.finished {
            control.wait_for_interrupt();
            return;
        }
        if !self.flush_pending(control) {
            return;
        }
        if self.at_end {
            self.on_stream_end(control);
            return;
        }

        let source_slot = self.source.clone();
        let mut slot = source_slot.lock();
        let Some(source) = slot.as_mut() else {
            drop(slot);
            control.wait_for_interrupt();
            return;
        };
        let info = source.info();

        let payloads = match source.next_packet() {
            Ok(Some(packet)) => {
                self.read_errors = 0;
                self.decode(&mut **source, &info, &packet)
            }
            Ok(None) => {
                let tail = self.decoder_tail(&mut **source, &info);
                drop(slot);
                for payload in tail {
                    self.accept(payload);
                }
                self.at_end = true;
                return;
            }
            Err(e) => {
                self.read_errors += 1;
                tracing::warn!("Packet read failed ({} in a row): {}", self.read_errors, e);
                if self.read_errors >= MAX_READ_ERRORS {
                    self.at_end = true;
                }
                return;
            }
        };
        drop(slot);

        for payload in payloads {
            self.accept(payload);
        }
        self.flush_pending(control);
    }
}
