use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use slideplay::audio::{AudioBlock, AudioFormat, AudioSink, AudioSinkFactory, SampleFormat};
use slideplay::media::{AudioStreamInfo, Packet, Result as MediaResult, VideoStreamInfo};
use slideplay::video::{PixelFormat, VideoFrame};
use slideplay::{
    Config, MediaError, MediaInfo, MediaPlayer, MediaSource, PlaybackListener, PlaybackState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const VIDEO: usize = 0;
const AUDIO: usize = 1;

/// 5.1 S16 source: 4 frames per block
const SOURCE_AUDIO: AudioFormat = AudioFormat {
    sample_rate: 48000,
    channels: 6,
    sample_format: SampleFormat::S16,
};
const SOURCE_BLOCK_BYTES: usize = 4 * 12;
const STEREO_BLOCK_BYTES: usize = 4 * 4;

/// In-memory container replaying a fixed packet list
struct ScriptedSource {
    info: MediaInfo,
    packets: Vec<(usize, i64)>,
    cursor: usize,
    seeks: Arc<AtomicUsize>,
}

impl ScriptedSource {
    fn new(has_video: bool, has_audio: bool, packets: Vec<(usize, i64)>) -> Self {
        Self {
            info: MediaInfo {
                video: has_video.then_some(VideoStreamInfo {
                    index: VIDEO,
                    width: 2,
                    height: 2,
                }),
                audio: has_audio.then_some(AudioStreamInfo {
                    index: AUDIO,
                    format: SOURCE_AUDIO,
                }),
                duration: None,
            },
            packets,
            cursor: 0,
            seeks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Video frames every `step_us`
    fn video(count: i64, step_us: i64) -> Self {
        Self::new(true, false, (0..count).map(|i| (VIDEO, i * step_us)).collect())
    }

    /// Interleaved video and audio packets every `step_us`
    fn av(count: i64, step_us: i64) -> Self {
        let packets = (0..count)
            .flat_map(|i| [(VIDEO, i * step_us), (AUDIO, i * step_us)])
            .collect();
        Self::new(true, true, packets)
    }

    fn audio(count: i64, step_us: i64) -> Self {
        Self::new(false, true, (0..count).map(|i| (AUDIO, i * step_us)).collect())
    }
}

impl MediaSource for ScriptedSource {
    fn info(&self) -> MediaInfo {
        self.info.clone()
    }

    fn next_packet(&mut self) -> MediaResult<Option<Packet>> {
        let Some(&(stream_index, pts)) = self.packets.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        Ok(Some(Packet {
            stream_index,
            pts,
            data: bytes::Bytes::new(),
        }))
    }

    fn decode_video(&mut self, packet: &Packet) -> MediaResult<Vec<VideoFrame>> {
        Ok(vec![VideoFrame::new(
            packet.pts,
            2,
            2,
            PixelFormat::RGBA,
            vec![0u8; 16],
        )])
    }

    fn decode_audio(&mut self, packet: &Packet) -> MediaResult<Vec<AudioBlock>> {
        Ok(vec![AudioBlock::new(
            packet.pts,
            SOURCE_AUDIO,
            vec![1u8; SOURCE_BLOCK_BYTES],
        )])
    }

    fn flush_video(&mut self) -> MediaResult<Vec<VideoFrame>> {
        Ok(Vec::new())
    }

    fn flush_audio(&mut self) -> MediaResult<Vec<AudioBlock>> {
        Ok(Vec::new())
    }

    fn seek(&mut self, _stream_index: usize, target: i64) -> MediaResult<()> {
        assert_eq!(target, 0);
        self.cursor = 0;
        self.seeks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records presented frame timestamps and their arrival times
struct RecordingListener {
    frames: Mutex<Vec<(i64, Instant)>>,
    finished: Sender<()>,
}

impl RecordingListener {
    fn new() -> (Arc<Self>, Receiver<()>) {
        let (tx, rx) = channel::unbounded();
        let listener = Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            finished: tx,
        });
        (listener, rx)
    }

    fn timestamps(&self) -> Vec<i64> {
        self.frames.lock().iter().map(|(pts, _)| *pts).collect()
    }

    fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.frames.lock().len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }
}

impl PlaybackListener for RecordingListener {
    fn on_video_frame(&self, frame: &VideoFrame) {
        self.frames.lock().push((frame.pts, Instant::now()));
    }

    fn on_finished(&self) {
        let _ = self.finished.send(());
    }
}

struct RecordingSink {
    written: Arc<Mutex<Vec<u8>>>,
}

impl AudioSink for RecordingSink {
    fn format(&self) -> AudioFormat {
        SOURCE_AUDIO.stereo()
    }

    fn write(&mut self, data: &[u8]) -> MediaResult<usize> {
        self.written.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    fn flush(&mut self) {}
}

/// Hands out recording sinks, or fails like a busy device
struct RecordingFactory {
    written: Arc<Mutex<Vec<u8>>>,
    available: bool,
}

impl AudioSinkFactory for RecordingFactory {
    fn open(&self, format: AudioFormat) -> MediaResult<Box<dyn AudioSink>> {
        assert_eq!(format.channels, 2);
        if !self.available {
            return Err(MediaError::AudioLineUnavailable("device busy".into()));
        }
        Ok(Box::new(RecordingSink {
            written: self.written.clone(),
        }))
    }
}

fn player(available: bool) -> (MediaPlayer, Arc<Mutex<Vec<u8>>>) {
    let written = Arc::new(Mutex::new(Vec::new()));
    let mut config = Config::default();
    config.drain.poll_interval = Duration::from_millis(20);
    config.drain.timeout = Duration::from_millis(500);
    let factory = RecordingFactory {
        written: written.clone(),
        available,
    };
    (MediaPlayer::new(config, Box::new(factory)).unwrap(), written)
}

fn assert_non_decreasing(timestamps: &[i64]) {
    for pair in timestamps.windows(2) {
        assert!(pair[0] <= pair[1], "went backwards: {:?}", timestamps);
    }
}

#[test]
fn test_plays_to_end_in_order() {
    let (player, written) = player(true);
    let (listener, finished) = RecordingListener::new();
    player.add_listener(listener.clone());

    player.set_media(Box::new(ScriptedSource::av(20, 10_000))).unwrap();
    player.play();
    finished.recv_timeout(Duration::from_secs(5)).unwrap();

    let timestamps = listener.timestamps();
    assert_eq!(timestamps.len(), 20);
    assert_non_decreasing(&timestamps);

    let stats = player.stats();
    assert_eq!(stats.dispatch.audio_blocks, 20);
    assert!(stats.buffer.video_count == 0 && stats.buffer.audio_count == 0);

    // Audio arrives downmixed to stereo
    player.stop();
    assert_eq!(written.lock().len(), 20 * STEREO_BLOCK_BYTES);
}

#[test]
fn test_stop_twice_leaves_buffer_empty() {
    let (player, _) = player(true);
    let (listener, _finished) = RecordingListener::new();
    player.add_listener(listener.clone());

    player.set_media(Box::new(ScriptedSource::av(200, 40_000))).unwrap();
    player.play();
    assert!(listener.wait_for_frames(2, Duration::from_secs(2)));

    for _ in 0..2 {
        player.stop();
        assert_eq!(player.state(), PlaybackState::Stopped);
        let stats = player.buffer_stats();
        assert_eq!(stats.video_count, 0);
        assert_eq!(stats.audio_count, 0);
        assert_eq!(player.stats().audio_queued, 0);
    }
}

#[test]
fn test_resume_presents_without_stale_wait() {
    let (player, _) = player(true);
    let (listener, _finished) = RecordingListener::new();
    player.add_listener(listener.clone());

    player.set_media(Box::new(ScriptedSource::video(10, 500_000))).unwrap();
    player.play();
    assert!(listener.wait_for_frames(1, Duration::from_secs(2)));

    // The player is now waiting ~450ms for the 500ms frame
    std::thread::sleep(Duration::from_millis(100));
    player.pause();
    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(listener.timestamps().len(), 1);
    assert!(player.stats().dispatch.dropped >= 1);

    let resumed = Instant::now();
    player.resume();
    assert!(listener.wait_for_frames(2, Duration::from_secs(2)));

    let frames = listener.frames.lock();
    let (pts, at) = frames[1];
    assert_eq!(pts, 1_000_000);
    assert!(at.duration_since(resumed) < Duration::from_millis(300));
}

#[test]
fn test_loop_playback_restarts_at_first_frame() {
    let (player, _) = player(true);
    let (listener, _finished) = RecordingListener::new();
    player.add_listener(listener.clone());

    let source = ScriptedSource::video(100, 20_000);
    let seeks = source.seeks.clone();
    player.set_media(Box::new(source)).unwrap();
    player.play();
    assert!(listener.wait_for_frames(10, Duration::from_secs(3)));

    player.loop_playback();
    assert_eq!(player.state(), PlaybackState::Playing);
    let before = listener.timestamps().len();
    assert!(listener.wait_for_frames(before + 5, Duration::from_secs(3)));

    let timestamps = listener.timestamps();
    let after = &timestamps[before..];
    assert_eq!(after[0], 0);
    assert_non_decreasing(after);
    assert_eq!(seeks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_nothing_dispatched_after_stop_returns() {
    let (player, written) = player(true);
    let (listener, _finished) = RecordingListener::new();
    player.add_listener(listener.clone());

    player.set_media(Box::new(ScriptedSource::av(200, 20_000))).unwrap();
    for _ in 0..3 {
        player.play();
        assert!(listener.wait_for_frames(listener.timestamps().len() + 3, Duration::from_secs(2)));
        player.stop();

        let frames = listener.timestamps().len();
        let audio_blocks = player.stats().dispatch.audio_blocks;
        let bytes = written.lock().len();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(listener.timestamps().len(), frames);
        assert_eq!(player.stats().dispatch.audio_blocks, audio_blocks);
        assert_eq!(player.stats().audio_queued, 0);
        assert_eq!(written.lock().len(), bytes);
    }
}

#[test]
fn test_looped_item_wraps_without_stutter() {
    let (player, _) = player(true);
    let (listener, finished) = RecordingListener::new();
    player.add_listener(listener.clone());

    player.set_looped(true);
    player.set_media(Box::new(ScriptedSource::video(6, 10_000))).unwrap();
    player.play();
    assert!(listener.wait_for_frames(18, Duration::from_secs(5)));
    player.stop();

    // Looping never reports the item as finished
    assert!(finished.try_recv().is_err());

    let timestamps = listener.timestamps();
    let mut laps = Vec::new();
    let mut lap = Vec::new();
    for pts in timestamps {
        if lap.last().is_some_and(|&last| pts < last) {
            laps.push(std::mem::take(&mut lap));
        }
        lap.push(pts);
    }
    assert!(laps.len() >= 2);
    for lap in &laps {
        assert_eq!(lap.first(), Some(&0));
        assert_eq!(lap.last(), Some(&50_000));
    }
}

#[test]
fn test_audio_only_item() {
    let (player, written) = player(true);
    let (listener, finished) = RecordingListener::new();
    player.add_listener(listener.clone());

    let session = player.set_media(Box::new(ScriptedSource::audio(30, 5_000))).unwrap();
    assert!(!session.info.has_video());
    player.play();
    finished.recv_timeout(Duration::from_secs(5)).unwrap();
    player.stop();

    assert!(listener.timestamps().is_empty());
    assert_eq!(written.lock().len(), 30 * STEREO_BLOCK_BYTES);
}

#[test]
fn test_muted_consumes_audio_silently() {
    let (player, written) = player(true);
    let (listener, finished) = RecordingListener::new();
    player.add_listener(listener);

    player.set_muted(true);
    player.set_media(Box::new(ScriptedSource::av(10, 5_000))).unwrap();
    player.play();
    finished.recv_timeout(Duration::from_secs(5)).unwrap();
    player.stop();

    assert!(written.lock().is_empty());
    assert_eq!(player.stats().dispatch.audio_blocks, 10);
}

#[test]
fn test_unavailable_audio_line_plays_video() {
    let (player, written) = player(false);
    let (listener, finished) = RecordingListener::new();
    player.add_listener(listener.clone());

    let session = player.set_media(Box::new(ScriptedSource::av(10, 5_000))).unwrap();
    assert!(matches!(
        session.audio_error,
        Some(MediaError::AudioLineUnavailable(_))
    ));

    player.play();
    finished.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(listener.timestamps().len(), 10);
    assert!(written.lock().is_empty());
}

#[test]
fn test_item_without_streams_is_rejected() {
    let (player, _) = player(true);
    let result = player.set_media(Box::new(ScriptedSource::new(false, false, Vec::new())));
    assert!(matches!(result, Err(MediaError::NoStreams)));

    player.play();
    assert_eq!(player.state(), PlaybackState::Stopped);
}

#[test]
fn test_replay_after_finish() {
    let (player, _) = player(true);
    let (listener, finished) = RecordingListener::new();
    player.add_listener(listener.clone());

    player.set_media(Box::new(ScriptedSource::video(5, 5_000))).unwrap();
    player.play();
    finished.recv_timeout(Duration::from_secs(5)).unwrap();

    player.stop();
    player.play();
    finished.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(
        listener.timestamps(),
        vec![0, 5_000, 10_000, 15_000, 20_000, 0, 5_000, 10_000, 15_000, 20_000]
    );
}
