use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::audio::output::SinkSlot;
use crate::audio::{AudioOutputStage, AudioQueue, AudioSinkFactory};
use crate::config::Config;
use crate::media::{MediaError, MediaInfo, MediaSource};
use crate::pipeline::{
    DispatchCounters, DispatchStats, ListenerList, PlayerStage, ReaderShared, ReaderStage,
    SourceSlot, Worker, WorkerControl,
};
use crate::sync::{BufferStats, MediaClock, PlaybackBuffer};
use crate::video::VideoFrame;

/// Facade playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// Receives decoded frames and playback notifications
///
/// `on_video_frame` and `on_finished` run on the player thread and must not
/// block for long; `on_state_changed` runs on the thread that issued the
/// command.
#[cfg_attr(test, mockall::automock)]
pub trait PlaybackListener: Send + Sync {
    fn on_video_frame(&self, frame: &VideoFrame);

    fn on_state_changed(&self, _state: PlaybackState) {}

    /// The current item played to its end (not called when looping)
    fn on_finished(&self) {}
}

/// Result of installing a new item
#[derive(Debug)]
pub struct SessionInfo {
    pub info: MediaInfo,

    /// Why the item's audio will not be heard, if its line could not be opened
    pub audio_error: Option<MediaError>,
}

/// Combined pipeline statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerStats {
    pub buffer: BufferStats,
    pub dispatch: DispatchStats,
    pub audio_queued: usize,
    pub audio_bytes_written: u64,
}

struct Session {
    state: PlaybackState,
    info: Option<MediaInfo>,
    sink_factory: Box<dyn AudioSinkFactory>,
}

/// Media player facade
///
/// Owns the reader, player and audio workers for its whole lifetime and
/// drives them through the Stopped / Playing / Paused state machine. All
/// commands take `&self` and may be issued from any thread; they are
/// serialized internally.
pub struct MediaPlayer {
    config: Config,
    session: Mutex<Session>,

    buffer: Arc<PlaybackBuffer>,
    audio_queue: Arc<AudioQueue>,
    source: SourceSlot,
    sink: SinkSlot,
    shared: Arc<ReaderShared>,
    listeners: ListenerList,
    counters: Arc<DispatchCounters>,
    muted: Arc<AtomicBool>,
    written: Arc<AtomicU64>,

    reader: Worker,
    player: Worker,
    audio: Worker,
}

impl MediaPlayer {
    /// Create a player with all workers spawned and paused
    ///
    /// # Arguments
    /// * `config` - Buffer, sync, audio and drain settings
    /// * `sink_factory` - Opens the audio line for each item
    pub fn new(config: Config, sink_factory: Box<dyn AudioSinkFactory>) -> crate::Result<Self> {
        let safety_wait = config.drain.poll_interval;
        let buffer = Arc::new(PlaybackBuffer::new(config.buffer, safety_wait));
        let audio_queue = Arc::new(AudioQueue::new(safety_wait));
        let source: SourceSlot = Arc::new(Mutex::new(None));
        let sink: SinkSlot = Arc::new(Mutex::new(None));
        let shared = Arc::new(ReaderShared::default());
        let listeners: ListenerList = Arc::new(RwLock::new(Vec::new()));
        let counters = Arc::new(DispatchCounters::default());
        let muted = Arc::new(AtomicBool::new(false));
        let written = Arc::new(AtomicU64::new(0));

        let reader = {
            let stage = ReaderStage::new(
                source.clone(),
                buffer.clone(),
                audio_queue.clone(),
                shared.clone(),
                config.drain.timeout,
            );
            let (waker_buffer, waker_audio) = (buffer.clone(), audio_queue.clone());
            let waker = move || {
                waker_buffer.wake_all();
                waker_audio.wake_all();
            };
            Worker::spawn(stage, WorkerControl::new("reader", true, waker))
                .context("Failed to spawn reader worker")?
        };

        let player = {
            let stage = PlayerStage::new(
                buffer.clone(),
                audio_queue.clone(),
                listeners.clone(),
                counters.clone(),
                MediaClock::new(&config.sync),
                config.sync.max_sleep,
            );
            let waker = buffer.clone();
            Worker::spawn(stage, WorkerControl::new("player", true, move || waker.wake_all()))
                .context("Failed to spawn player worker")?
        };

        let audio = {
            let stage =
                AudioOutputStage::new(audio_queue.clone(), sink.clone(), muted.clone(), written.clone());
            let waker = audio_queue.clone();
            Worker::spawn(stage, WorkerControl::new("audio-output", true, move || waker.wake_all()))
                .context("Failed to spawn audio worker")?
        };

        tracing::debug!("Media player created: {:?}", config);

        Ok(Self {
            config,
            session: Mutex::new(Session {
                state: PlaybackState::Stopped,
                info: None,
                sink_factory,
            }),
            buffer,
            audio_queue,
            source,
            sink,
            shared,
            listeners,
            counters,
            muted,
            written,
            reader,
            player,
            audio,
        })
    }

    /// Stop the current item and install `source` as the next one
    ///
    /// Fails with `NoStreams` if the source has neither video nor audio; the
    /// current item is then left as it was. An audio line that cannot be
    /// opened is reported in the returned `SessionInfo`; the item then plays
    /// with its audio discarded.
    pub fn set_media(&self, source: Box<dyn MediaSource>) -> Result<SessionInfo, MediaError> {
        let info = source.info();
        if !info.has_video() && !info.has_audio() {
            tracing::warn!("Rejected media without video or audio streams");
            return Err(MediaError::NoStreams);
        }

        let mut session = self.session.lock();
        let changed = self.stop_locked(&mut session);

        let decode_audio = self.config.audio.enabled && info.has_audio();
        let mut audio_error = None;
        let mut sink = None;
        if decode_audio && let Some(audio) = info.audio {
            match session.sink_factory.open(audio.format.stereo()) {
                Ok(opened) => sink = Some(opened),
                Err(e) => {
                    tracing::warn!("Audio line unavailable, playing without sound: {}", e);
                    audio_error = Some(e);
                }
            }
        }

        *self.sink.lock() = sink;
        self.audio_queue.clear();
        self.buffer.configure(info.has_video(), decode_audio);
        *self.source.lock() = Some(source);
        self.shared.audio_enabled.store(decode_audio, Ordering::SeqCst);
        self.shared.rewind.store(false, Ordering::SeqCst);
        self.shared.new_session.store(true, Ordering::SeqCst);

        tracing::info!(
            "Media set: video {}, audio {}{}",
            info.has_video(),
            info.has_audio(),
            if audio_error.is_some() { " (muted)" } else { "" }
        );
        session.info = Some(info.clone());
        drop(session);

        if changed {
            self.notify_state(PlaybackState::Stopped);
        }
        Ok(SessionInfo { info, audio_error })
    }

    /// Stopped -> Playing. Acts as `resume` while paused.
    pub fn play(&self) {
        let mut session = self.session.lock();
        match session.state {
            PlaybackState::Stopped => {
                if session.info.is_none() {
                    tracing::debug!("play() ignored: no media set");
                    return;
                }
                self.audio_queue.clear();
                self.start_workers();
                session.state = PlaybackState::Playing;
                tracing::info!("Playback started");
            }
            PlaybackState::Paused => {
                self.start_workers();
                session.state = PlaybackState::Playing;
                tracing::info!("Playback resumed");
            }
            PlaybackState::Playing => {
                tracing::debug!("play() ignored: already playing");
                return;
            }
        }
        drop(session);
        self.notify_state(PlaybackState::Playing);
    }

    /// Playing -> Paused
    pub fn pause(&self) {
        let mut session = self.session.lock();
        if session.state != PlaybackState::Playing {
            tracing::debug!("pause() ignored in state {:?}", session.state);
            return;
        }

        self.reader.set_paused(true);
        self.audio.set_paused(true);
        self.player.pause_and_park(self.config.drain.timeout);
        if let Some(sink) = self.sink.lock().as_mut() {
            sink.pause();
        }
        session.state = PlaybackState::Paused;
        drop(session);

        tracing::info!("Playback paused");
        self.notify_state(PlaybackState::Paused);
    }

    /// Paused -> Playing; the player re-anchors its clock on the next payload
    pub fn resume(&self) {
        let mut session = self.session.lock();
        if session.state != PlaybackState::Paused {
            tracing::debug!("resume() ignored in state {:?}", session.state);
            return;
        }

        self.start_workers();
        session.state = PlaybackState::Playing;
        drop(session);

        tracing::info!("Playback resumed");
        self.notify_state(PlaybackState::Playing);
    }

    /// Playing/Paused -> Stopped, rewinding the item to its start
    ///
    /// Blocks until the buffered payloads are drained (bounded by the drain
    /// timeout). Calling it again while stopped does nothing.
    pub fn stop(&self) {
        let mut session = self.session.lock();
        let changed = self.stop_locked(&mut session);
        drop(session);

        if changed {
            self.notify_state(PlaybackState::Stopped);
        }
    }

    /// Restart the current item from the beginning
    pub fn loop_playback(&self) {
        self.stop();
        self.play();
    }

    /// Arbitrary repositioning is not supported; use `stop`/`loop_playback`
    pub fn seek(&self, position: Duration) -> Result<(), MediaError> {
        tracing::debug!("seek({:?}) requested", position);
        Err(MediaError::SeekUnsupported)
    }

    /// Restart automatically at end of stream instead of finishing
    pub fn set_looped(&self, looped: bool) {
        self.shared.looped.store(looped, Ordering::SeqCst);
    }

    pub fn is_looped(&self) -> bool {
        self.shared.looped.load(Ordering::SeqCst)
    }

    /// Keep consuming audio but discard it instead of writing to the line
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn add_listener(&self, listener: Arc<dyn PlaybackListener>) {
        self.listeners.write().push(listener);
    }

    /// Returns true if `listener` was registered
    pub fn remove_listener(&self, listener: &Arc<dyn PlaybackListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn state(&self) -> PlaybackState {
        self.session.lock().state
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.session.lock().info.clone()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    pub fn stats(&self) -> PlayerStats {
        PlayerStats {
            buffer: self.buffer.stats(),
            dispatch: self.counters.snapshot(),
            audio_queued: self.audio_queue.len(),
            audio_bytes_written: self.written.load(Ordering::Relaxed),
        }
    }

    fn start_workers(&self) {
        if let Some(sink) = self.sink.lock().as_mut() {
            sink.resume();
        }
        self.audio.set_paused(false);
        self.player.set_paused(false);
        self.reader.set_paused(false);
    }

    /// Returns true if the state changed
    fn stop_locked(&self, session: &mut Session) -> bool {
        match session.state {
            PlaybackState::Stopped => return false,
            PlaybackState::Playing => {
                let timeout = self.config.drain.timeout;
                // Stop producing, let the player present what is buffered
                self.reader.pause_and_park(timeout);
                self.shared.rewind.store(true, Ordering::SeqCst);
                self.buffer.drain(timeout);
                // The player may still hold the last popped payload
                self.player.pause_and_park(timeout);
                self.audio_queue.drain(timeout);
                self.audio.pause_and_park(timeout);
            }
            PlaybackState::Paused => {
                // Nothing may be dispatched while paused
                let timeout = self.config.drain.timeout;
                self.reader.pause_and_park(timeout);
                self.player.pause_and_park(timeout);
                self.audio.pause_and_park(timeout);
                self.shared.rewind.store(true, Ordering::SeqCst);
                self.buffer.flush();
                self.audio_queue.clear();
            }
        }

        if let Some(sink) = self.sink.lock().as_mut() {
            sink.pause();
            sink.flush();
        }
        session.state = PlaybackState::Stopped;
        tracing::info!("Playback stopped");
        true
    }

    fn notify_state(&self, state: PlaybackState) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_state_changed(state);
        }
    }
}

impl Drop for MediaPlayer {
    fn drop(&mut self) {
        self.reader.end();
        self.player.end();
        self.audio.end();
        tracing::debug!("Media player shut down");
    }
}
