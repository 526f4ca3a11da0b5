//! Latest-frame-wins hand-off between the capture thread and its readers

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::capture::Frame;

/// A frame together with the slot generation it was published under
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub generation: u64,
    pub frame: Arc<Frame>,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Arc<Frame>>,
    generation: u64,
}

/// Single-frame buffer shared by exactly one producer and any number of
/// readers.
///
/// Publishing replaces the held frame instead of queueing it, so a slow
/// reader only ever costs itself frames and memory stays bounded to one
/// frame plus whatever snapshots readers still hold. The lock covers the
/// pointer swap only.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        // A panicking reader cannot leave the state half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the held frame and returns the new generation.
    pub fn publish(&self, frame: Frame) -> u64 {
        let frame = Arc::new(frame);
        let (superseded, generation) = {
            let mut state = self.lock();
            state.generation += 1;
            (state.frame.replace(frame), state.generation)
        };
        // Released outside the lock.
        drop(superseded);
        generation
    }

    /// Current frame and generation; never waits for a new frame.
    pub fn read_latest(&self) -> Option<FrameSnapshot> {
        let state = self.lock();
        state.frame.as_ref().map(|frame| FrameSnapshot {
            generation: state.generation,
            frame: Arc::clone(frame),
        })
    }

    /// Like [`read_latest`](Self::read_latest) but `None` unless something
    /// newer than `generation` was published.
    pub fn read_newer_than(&self, generation: u64) -> Option<FrameSnapshot> {
        self.read_latest()
            .filter(|snapshot| snapshot.generation > generation)
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Drops the held frame. The generation is kept so readers never see it
    /// go backward.
    pub fn clear(&self) {
        let old = self.lock().frame.take();
        drop(old);
    }
}
