//! Timestamp-ordered frame store

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::capture::Frame;

/// First timestamp reported by an empty store
pub const EMPTY_FIRST_TIMESTAMP: Duration = Duration::ZERO;

/// Last timestamp reported by an empty store. Non-zero so rate calculations
/// over an empty recording never divide by zero.
pub const EMPTY_LAST_TIMESTAMP: Duration = Duration::from_nanos(1);

/// Frames keyed by capture timestamp, ascending.
///
/// Every operation takes the internal lock once, so an insert and a bounds
/// read are linearizable with respect to each other. When two frames share a
/// timestamp the first one inserted is kept.
#[derive(Default)]
pub struct FrameStore {
    frames: RwLock<BTreeMap<Duration, Arc<Frame>>>,
    duplicates: AtomicUsize,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Duration, Arc<Frame>>> {
        self.frames.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<Duration, Arc<Frame>>> {
        self.frames.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false if a frame with the same timestamp is already stored
    pub fn insert(&self, frame: Arc<Frame>) -> bool {
        match self.write().entry(frame.timestamp()) {
            Entry::Vacant(slot) => {
                slot.insert(frame);
                true
            }
            Entry::Occupied(_) => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn first_timestamp(&self) -> Duration {
        self.read()
            .keys()
            .next()
            .copied()
            .unwrap_or(EMPTY_FIRST_TIMESTAMP)
    }

    pub fn last_timestamp(&self) -> Duration {
        self.read()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(EMPTY_LAST_TIMESTAMP)
    }

    /// First and last timestamp read under one lock
    pub fn bounds(&self) -> (Duration, Duration) {
        let frames = self.read();
        match (frames.keys().next(), frames.keys().next_back()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => (EMPTY_FIRST_TIMESTAMP, EMPTY_LAST_TIMESTAMP),
        }
    }

    pub fn duration(&self) -> Duration {
        let (first, last) = self.bounds();
        last.saturating_sub(first)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, timestamp: Duration) -> Option<Arc<Frame>> {
        self.read().get(&timestamp).cloned()
    }

    /// Ascending snapshot of the stored frames
    pub fn frames(&self) -> Vec<Arc<Frame>> {
        self.read().values().cloned().collect()
    }

    /// Frames rejected because their timestamp was already taken
    pub fn duplicates(&self) -> usize {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.write().clear();
        self.duplicates.store(0, Ordering::Relaxed);
    }

    /// Swap the whole content for `frames`. Returns how many were kept.
    pub fn replace(&self, frames: Vec<Arc<Frame>>) -> usize {
        let mut map = BTreeMap::new();
        let mut duplicates = 0;
        for frame in frames {
            match map.entry(frame.timestamp()) {
                Entry::Vacant(slot) => {
                    slot.insert(frame);
                }
                Entry::Occupied(_) => duplicates += 1,
            }
        }

        let kept = map.len();
        *self.write() = map;
        self.duplicates.store(duplicates, Ordering::Relaxed);
        kept
    }
}
