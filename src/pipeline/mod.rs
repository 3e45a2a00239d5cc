/// Worker threads of the playback pipeline
///
/// Reader -> PlaybackBuffer -> Player -> {listeners, AudioQueue -> audio stage}
pub mod player;
pub mod reader;
pub mod worker;

pub use player::{DispatchCounters, DispatchStats, ListenerList, PlayerStage};
pub use reader::{ReaderShared, ReaderStage, SourceSlot};
pub use worker::{Worker, WorkerControl, WorkerTask};
