use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::channel::{self, Sender};
use slideplay::{
    Config, MediaPlayer, PlaybackListener, PlaybackState,
    audio::CpalAudioFactory,
    logging,
    media::FfmpegSource,
    video::VideoFrame,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Play a local media file through the buffered playback engine
#[derive(Parser, Debug, Clone)]
#[command(name = "slideplay")]
#[command(about = "Buffered audio/video playback of local media files", long_about = None)]
struct Args {
    /// Media file to play
    file: PathBuf,

    /// Restart from the beginning at end of stream
    #[arg(long = "loop", default_value_t = false)]
    looped: bool,

    /// Consume audio without writing it to the output device
    #[arg(long, default_value_t = false)]
    mute: bool,

    /// Disable audio decoding entirely
    #[arg(long, default_value_t = false)]
    no_audio: bool,

    /// Stop after this many seconds (default: play to the end)
    #[arg(long)]
    seconds: Option<u64>,

    /// Default log filter when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Counts presented frames and reports end of playback
struct ProgressListener {
    frames: AtomicU64,
    finished: Sender<()>,
}

impl PlaybackListener for ProgressListener {
    fn on_video_frame(&self, frame: &VideoFrame) {
        let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 {
            info!("First frame: {}x{} {:?}", frame.width, frame.height, frame.format);
        } else if count % 250 == 0 {
            info!("Presented {} frames (pts {}us)", count, frame.pts);
        }
    }

    fn on_state_changed(&self, state: PlaybackState) {
        info!("State: {:?}", state);
    }

    fn on_finished(&self) {
        let _ = self.finished.try_send(());
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;

    info!("Starting slideplay: {}", args.file.display());

    let mut config = Config::default();
    config.audio.enabled = !args.no_audio;
    let factory = CpalAudioFactory::new(config.audio.line_buffer_ms);
    let player = MediaPlayer::new(config, Box::new(factory))?;

    let (finished_tx, finished_rx) = channel::bounded(1);
    let listener = Arc::new(ProgressListener {
        frames: AtomicU64::new(0),
        finished: finished_tx,
    });
    player.add_listener(listener.clone());

    let source = FfmpegSource::open(&args.file)
        .with_context(|| format!("Failed to open {}", args.file.display()))?;
    let session = player.set_media(Box::new(source))?;
    if let Some(e) = &session.audio_error {
        warn!("Playing without sound: {}", e);
    }
    if let Some(duration) = session.info.duration {
        info!("Duration: {:.1}s", duration.as_secs_f64());
    }

    player.set_looped(args.looped);
    player.set_muted(args.mute);
    player.play();

    match args.seconds {
        Some(seconds) => {
            if finished_rx.recv_timeout(Duration::from_secs(seconds)).is_err() {
                info!("Stopping after {}s", seconds);
            }
        }
        None => {
            finished_rx
                .recv()
                .context("Playback ended without a finish notification")?;
        }
    }

    player.stop();

    let stats = player.stats();
    info!(
        "Done: {} frames, {} audio blocks, {} dropped, {} buffer overflows, {} audio bytes written",
        stats.dispatch.video_frames,
        stats.dispatch.audio_blocks,
        stats.dispatch.dropped,
        stats.buffer.dropped,
        stats.audio_bytes_written
    );
    info!("Listener saw {} frames", listener.frames.load(Ordering::Relaxed));

    Ok(())
}
