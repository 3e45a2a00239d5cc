use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Playback engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Playback buffer thresholds
    pub buffer: BufferConfig,

    /// Clock synchronization tuning
    pub sync: SyncConfig,

    /// Audio output configuration
    pub audio: AudioConfig,

    /// Stop/loop drain behaviour
    pub drain: DrainConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Video frames needed before the player starts dequeuing
    pub target_video: usize,

    /// Video frames at which the reader blocks (once audio is also buffered)
    pub soft_max_video: usize,

    /// Video frames at which the oldest entries are dropped
    pub hard_max_video: usize,

    /// Audio blocks needed before the player starts dequeuing
    pub target_audio: usize,

    /// Audio blocks at which the reader blocks when the item has no video
    pub soft_max_audio_only: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            target_video: 3,
            soft_max_video: 5,
            hard_max_video: 20,
            target_audio: 3,
            soft_max_audio_only: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Lateness allowed for video before it is presented without waiting
    #[serde(with = "millis")]
    pub video_tolerance: Duration,

    /// Lateness allowed for audio
    #[serde(with = "millis")]
    pub audio_tolerance: Duration,

    /// Cap on a single synchronization sleep (guards corrupt timestamps)
    #[serde(with = "millis")]
    pub max_sleep: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            video_tolerance: Duration::from_millis(50),
            audio_tolerance: Duration::ZERO,
            max_sleep: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Enable audio output
    pub enabled: bool,

    /// Size of the device line buffer (ms)
    pub line_buffer_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            line_buffer_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Re-check interval for every blocking wait
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// Give up waiting for consumers after this long and discard the rest
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Durations as whole milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
