use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{AudioBlock, AudioSink};
use crate::pipeline::{WorkerControl, WorkerTask};
use crate::sync::Drained;

/// Shared slot holding the current session's audio line
pub type SinkSlot = Arc<Mutex<Option<Box<dyn AudioSink>>>>;

struct QueueState {
    blocks: VecDeque<AudioBlock>,
    in_flight: bool,
    generation: u64,
}

/// Unbounded FIFO of audio blocks between the player and audio stages
pub struct AudioQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
    safety_wait: Duration,
}

impl AudioQueue {
    pub fn new(safety_wait: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                blocks: VecDeque::new(),
                in_flight: false,
                generation: 0,
            }),
            changed: Condvar::new(),
            safety_wait,
        }
    }

    /// Append a block; never blocks
    pub fn enqueue(&self, block: AudioBlock) {
        self.state.lock().blocks.push_back(block);
        self.changed.notify_all();
    }

    /// Take the next block, marking it in flight until `finish_block`.
    ///
    /// Returns the block with the queue generation it was taken in, or None
    /// if `interrupted` fired first.
    pub fn pop_blocking(&self, interrupted: impl Fn() -> bool) -> Option<(AudioBlock, u64)> {
        let mut state = self.state.lock();
        loop {
            if interrupted() {
                return None;
            }
            if let Some(block) = state.blocks.pop_front() {
                state.in_flight = true;
                return Some((block, state.generation));
            }
            self.changed.wait_for(&mut state, self.safety_wait);
        }
    }

    /// The in-flight block has been written or discarded
    pub fn finish_block(&self) {
        self.state.lock().in_flight = false;
        self.changed.notify_all();
    }

    /// Wait until the queue and the in-flight block are empty, then clear
    /// unconditionally. Returns true if the consumer caught up in time.
    pub fn drain(&self, timeout: Duration) -> bool {
        self.drain_until(timeout, || false) == Drained::Emptied
    }

    /// `drain` that returns `Interrupted` without clearing once
    /// `interrupted` fires
    pub fn drain_until(&self, timeout: Duration, interrupted: impl Fn() -> bool) -> Drained {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        let mut outcome = Drained::Emptied;
        while !state.blocks.is_empty() || state.in_flight {
            if interrupted() {
                return Drained::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                outcome = Drained::TimedOut;
                break;
            }
            let wait = self.safety_wait.min(deadline - now);
            self.changed.wait_for(&mut state, wait);
        }

        if outcome == Drained::TimedOut {
            tracing::warn!(
                "Audio queue drain timed out, discarded {} blocks",
                state.blocks.len()
            );
        }
        Self::clear_locked(&mut state);
        drop(state);
        self.changed.notify_all();
        outcome
    }

    /// Drop everything queued, including a block the stage has started on
    pub fn clear(&self) {
        Self::clear_locked(&mut self.state.lock());
        self.changed.notify_all();
    }

    fn clear_locked(state: &mut QueueState) {
        state.blocks.clear();
        state.in_flight = false;
        state.generation += 1;
    }

    pub fn wake_all(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

struct PendingBlock {
    block: AudioBlock,
    offset: usize,
    generation: u64,
}

/// Audio worker: writes queued blocks to the sink in arrival order
pub struct AudioOutputStage {
    queue: Arc<AudioQueue>,
    sink: SinkSlot,
    muted: Arc<AtomicBool>,
    written: Arc<AtomicU64>,
    current: Option<PendingBlock>,
}

impl AudioOutputStage {
    pub fn new(
        queue: Arc<AudioQueue>,
        sink: SinkSlot,
        muted: Arc<AtomicBool>,
        written: Arc<AtomicU64>,
    ) -> Self {
        Self {
            queue,
            sink,
            muted,
            written,
            current: None,
        }
    }

    fn discard_current(&mut self) {
        if self.current.take().is_some() {
            self.queue.finish_block();
        }
    }
}

impl WorkerTask for AudioOutputStage {
    fn execute_task(&mut self, control: &WorkerControl) {
        if self.current.is_none() {
            let Some((block, generation)) = self.queue.pop_blocking(|| control.is_interrupted())
            else {
                return;
            };
            self.current = Some(PendingBlock {
                block,
                offset: 0,
                generation,
            });
        }

        let Some(pending) = self.current.as_mut() else {
            return;
        };
        if pending.generation != self.queue.generation() {
            // Cleared by stop while we were paused mid-block
            self.current = None;
            return;
        }
        if self.muted.load(Ordering::Relaxed) {
            self.discard_current();
            return;
        }

        let mut slot = self.sink.lock();
        if slot.is_none() {
            drop(slot);
            self.discard_current();
            return;
        }
        let Some(sink) = slot.as_mut() else {
            return;
        };

        let frame_size = sink.format().frame_size().max(1);
        let data = pending.block.data.clone();
        while data.len() - pending.offset >= frame_size {
            if control.is_interrupted() {
                // Remainder is written after resume unless the queue is cleared
                return;
            }
            if pending.generation != self.queue.generation() {
                // Drain gave up on a line that stopped accepting data
                self.current = None;
                return;
            }
            match sink.write(&data[pending.offset..]) {
                Ok(n) => {
                    pending.offset += n;
                    self.written.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!("Audio sink write failed: {}", e);
                    break;
                }
            }
        }
        drop(slot);
        self.discard_current();
    }
}
