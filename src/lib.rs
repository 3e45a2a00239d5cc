/// Buffered audio/video playback engine
///
/// A reader thread decodes a media item into a timestamp-ordered playback
/// buffer, a player thread paces the buffered payloads against a media clock
/// and hands video frames to listeners, and an audio thread writes the
/// audio blocks to the output line. `MediaPlayer` ties the three together.
pub mod audio;
pub mod config;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod player;
pub mod sync;
pub mod video;

pub use config::Config;
pub use media::{MediaError, MediaInfo, MediaSource};
pub use player::{MediaPlayer, PlaybackListener, PlaybackState, PlayerStats, SessionInfo};

/// Result type for the application
pub type Result<T> = anyhow::Result<T>;
