//! Locked swap slot bridging the capture thread and the consumer cycle

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;

use crate::capture::PixelBuffer;

/// Waiting half of a double buffer.
///
/// The producer stores into the slot, the consumer exchanges its own buffer
/// with it. Both happen under one lock held only for the assignment or the
/// swap, and the fresh flag lives under that same lock so a consumer can
/// never pick up a frame without also clearing its flag.
pub struct SwapBuffer {
    slot: Mutex<Slot>,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct Slot {
    pixels: PixelBuffer,
    fresh: bool,
    link: Link,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Detached,
    Attached,
    /// Terminal; nothing is accepted any more
    Sealed,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
    frames_rejected: AtomicUsize,
}

/// Snapshot of swap buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapStats {
    /// Frames stored into the waiting slot
    pub frames_written: usize,
    /// Frames the consumer swapped in
    pub frames_read: usize,
    /// Frames overwritten before the consumer picked them up
    pub frames_dropped: usize,
    /// Frames refused because the slot was detached or sealed
    pub frames_rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// Stored, replacing a frame the consumer never saw
    Replaced,
    Rejected,
}

impl SwapBuffer {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                pixels: PixelBuffer::default(),
                fresh: false,
                link: Link::Detached,
            }),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start accepting frames. No-op once sealed.
    pub fn attach(&self) {
        let mut slot = self.lock();
        if slot.link != Link::Sealed {
            slot.link = Link::Attached;
        }
    }

    /// Stop accepting frames; a frame already waiting stays available
    pub fn detach(&self) {
        let mut slot = self.lock();
        if slot.link == Link::Attached {
            slot.link = Link::Detached;
        }
    }

    /// Permanently stop accepting frames
    pub fn seal(&self) {
        self.lock().link = Link::Sealed;
    }

    /// Producer: place pixels in the waiting slot
    pub fn store(&self, pixels: &PixelBuffer) -> StoreOutcome {
        let outcome = {
            let mut slot = self.lock();
            if slot.link != Link::Attached {
                StoreOutcome::Rejected
            } else {
                // Moves the shared handle only, the pixel data is not copied
                slot.pixels = pixels.clone();
                let replaced = std::mem::replace(&mut slot.fresh, true);
                if replaced {
                    StoreOutcome::Replaced
                } else {
                    StoreOutcome::Stored
                }
            }
        };

        match outcome {
            StoreOutcome::Stored => {
                self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
            }
            StoreOutcome::Replaced => {
                self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            StoreOutcome::Rejected => {
                self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    /// Consumer: exchange `front` with the waiting slot if a fresh frame is
    /// there. Returns whether a swap happened.
    pub fn swap_into(&self, front: &mut PixelBuffer) -> bool {
        let mut slot = self.lock();
        if !std::mem::take(&mut slot.fresh) {
            return false;
        }
        std::mem::swap(front, &mut slot.pixels);
        drop(slot);

        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn has_fresh(&self) -> bool {
        self.lock().fresh
    }

    pub fn stats(&self) -> SwapStats {
        SwapStats {
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_read: self.stats.frames_read.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            frames_rejected: self.stats.frames_rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for SwapBuffer {
    fn default() -> Self {
        Self::new()
    }
}
