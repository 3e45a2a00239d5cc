use crate::audio::AudioBlock;
use crate::media::MediaKind;
use crate::video::VideoFrame;

#[derive(Debug, Clone)]
pub enum Payload {
    Video(VideoFrame),
    Audio(AudioBlock),
}

/// Decoded unit handed from the reader to the player, keyed by timestamp
#[derive(Debug, Clone)]
pub struct TimedPayload {
    timestamp: i64,
    payload: Payload,
}

impl TimedPayload {
    pub fn video(frame: VideoFrame) -> Self {
        Self {
            timestamp: frame.pts,
            payload: Payload::Video(frame),
        }
    }

    pub fn audio(block: AudioBlock) -> Self {
        Self {
            timestamp: block.pts,
            payload: Payload::Audio(block),
        }
    }

    /// Presentation timestamp in microseconds
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn kind(&self) -> MediaKind {
        match self.payload {
            Payload::Video(_) => MediaKind::Video,
            Payload::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}
