/// Presentation clock and the timestamp-ordered playback buffer
pub mod buffer;
pub mod clock;
pub mod payload;

pub use buffer::{BufferStats, Dequeued, Drained, PlaybackBuffer};
pub use clock::MediaClock;
pub use payload::{Payload, TimedPayload};
