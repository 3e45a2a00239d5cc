/// Container/decoder boundary of the playback pipeline
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

use crate::audio::{AudioBlock, AudioFormat};
use crate::video::VideoFrame;

pub mod ffmpeg;

pub use self::ffmpeg::FfmpegSource;

/// Media errors
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No playable video or audio stream found")]
    NoStreams,

    #[error("Audio line unavailable: {0}")]
    AudioLineUnavailable(String),

    #[error("Failed to open media: {0}")]
    Open(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Seeking to an arbitrary position is not supported")]
    SeekUnsupported,

    #[error("FFmpeg error: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),
}

pub type Result<T> = std::result::Result<T, MediaError>;

/// Kind of decoded data travelling through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Compressed packet read from the container
#[derive(Debug, Clone)]
pub struct Packet {
    /// Index of the stream this packet belongs to
    pub stream_index: usize,

    /// Presentation timestamp in microseconds
    pub pts: i64,

    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoStreamInfo {
    pub index: usize,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamInfo {
    pub index: usize,

    /// Format of the blocks produced by `decode_audio` (before downmix)
    pub format: AudioFormat,
}

/// Streams selected for playback in the opened container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInfo {
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
    pub duration: Option<Duration>,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Map a packet's stream index to the media kind it carries
    pub fn kind_of(&self, stream_index: usize) -> Option<MediaKind> {
        if self.video.is_some_and(|v| v.index == stream_index) {
            Some(MediaKind::Video)
        } else if self.audio.is_some_and(|a| a.index == stream_index) {
            Some(MediaKind::Audio)
        } else {
            None
        }
    }

    /// Indices of every stream the pipeline reads
    pub fn active_streams(&self) -> Vec<usize> {
        self.video
            .map(|v| v.index)
            .into_iter()
            .chain(self.audio.map(|a| a.index))
            .collect()
    }
}

/// Opaque demuxer + stream decoders feeding the reader stage
///
/// Implementations own the container and one decoder per selected stream.
/// All timestamps are microseconds.
#[cfg_attr(test, mockall::automock)]
pub trait MediaSource: Send {
    fn info(&self) -> MediaInfo;

    /// Read the next packet, `Ok(None)` at end of stream
    fn next_packet(&mut self) -> Result<Option<Packet>>;

    /// Decode a video packet into zero or more complete frames
    fn decode_video(&mut self, packet: &Packet) -> Result<Vec<VideoFrame>>;

    /// Decode an audio packet into zero or more interleaved sample blocks
    fn decode_audio(&mut self, packet: &Packet) -> Result<Vec<AudioBlock>>;

    /// Signal end of input to the video decoder and collect the frames it
    /// was still holding. A later `seek` makes the decoder usable again.
    fn flush_video(&mut self) -> Result<Vec<VideoFrame>>;

    /// Same as `flush_video` for the audio decoder
    fn flush_audio(&mut self) -> Result<Vec<AudioBlock>>;

    /// Reposition `stream_index` at `target` µs and flush its decoder
    fn seek(&mut self, stream_index: usize, target: i64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;

    fn info() -> MediaInfo {
        MediaInfo {
            video: Some(VideoStreamInfo {
                index: 0,
                width: 640,
                height: 480,
            }),
            audio: Some(AudioStreamInfo {
                index: 2,
                format: AudioFormat::new(48000, 6, SampleFormat::S16),
            }),
            duration: None,
        }
    }

    #[test]
    fn test_kind_of() {
        let info = info();
        assert_eq!(info.kind_of(0), Some(MediaKind::Video));
        assert_eq!(info.kind_of(2), Some(MediaKind::Audio));
        assert_eq!(info.kind_of(1), None);
        assert_eq!(info.active_streams(), vec![0, 2]);
    }

    #[test]
    fn test_audio_only_info() {
        let info = MediaInfo {
            video: None,
            ..info()
        };
        assert!(!info.has_video());
        assert!(info.has_audio());
        assert_eq!(info.active_streams(), vec![2]);
    }
}
