//! Recorder: accumulates the frames a grabber delivers, ordered by timestamp
//!
//! Recording is independent of display. The recorder listens on the
//! grabber's capture-thread notification, so every frame the grabber accepts
//! is stored even when the consumer only displays a fraction of them.

pub mod store;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::capture::Frame;
use crate::grabber::{GrabberHandle, ListenerId};
use crate::{Error, Result};

pub use store::FrameStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecorderState {
    NoGrabber,
    GrabberNotReady,
    Ready,
    Recording,
    Saving,
    Loading,
}

impl RecorderState {
    pub fn label(self) -> &'static str {
        match self {
            RecorderState::NoGrabber => "No grabber",
            RecorderState::GrabberNotReady => "Grabber not ready",
            RecorderState::Ready => "Ready",
            RecorderState::Recording => "Recording",
            RecorderState::Saving => "Saving",
            RecorderState::Loading => "Loading",
        }
    }

    /// Recording, saving and loading all own the store
    fn is_busy(self) -> bool {
        matches!(
            self,
            RecorderState::Recording | RecorderState::Saving | RecorderState::Loading
        )
    }
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Persistence collaborator for recorded sequences.
///
/// The on-disk format belongs entirely to the implementation.
pub trait RecordingArchive {
    /// Persist frames, given in ascending timestamp order
    fn save(&mut self, frames: &[Arc<Frame>]) -> Result<()>;

    fn load(&mut self) -> Result<Vec<Arc<Frame>>>;
}

pub struct Recorder {
    state: RecorderState,
    grabber: Option<GrabberHandle>,
    store: Arc<FrameStore>,
    subscription: Option<ListenerId>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            state: RecorderState::NoGrabber,
            grabber: None,
            store: Arc::new(FrameStore::new()),
            subscription: None,
        }
    }

    /// Bind a grabber. Only allowed from `NoGrabber` or `Ready`; otherwise
    /// the current binding is kept.
    pub fn set_grabber(&mut self, grabber: GrabberHandle) -> bool {
        if !matches!(self.state, RecorderState::NoGrabber | RecorderState::Ready) {
            error!("Cannot set grabber, recorder is {}", self.state);
            return false;
        }
        self.grabber = Some(grabber);
        self.state = RecorderState::Ready;
        debug!("Recorder bound to grabber");
        true
    }

    /// Leave `GrabberNotReady` for `Ready`, keeping the bound grabber, so
    /// `start` can be retried once its device is open.
    pub fn rearm(&mut self) -> bool {
        if self.state != RecorderState::GrabberNotReady {
            warn!("Nothing to rearm, recorder is {}", self.state);
            return false;
        }
        self.state = RecorderState::Ready;
        debug!("Recorder rearmed");
        true
    }

    /// Start recording every frame the bound grabber accepts.
    ///
    /// Returns false, leaving the store untouched, when the recorder is not
    /// ready or the grabber's device is not open.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> bool {
        self.stop();

        if self.state != RecorderState::Ready {
            error!("Cannot start recorder, recorder is not ready ({})", self.state);
            return false;
        }
        let Some(grabber) = self.grabber.as_ref() else {
            error!("Cannot start recorder, no grabber bound");
            return false;
        };
        if !grabber.is_device_open() {
            error!("Cannot start recorder, grabber is not open");
            self.state = RecorderState::GrabberNotReady;
            return false;
        }

        let store = Arc::clone(&self.store);
        let id = grabber.subscribe(move |frame| {
            if store.insert(Arc::clone(frame)) {
                metrics::counter!("framegrab_frames_recorded_total").increment(1);
            } else {
                warn!(
                    "Frame {} shares timestamp {:?} with a recorded frame, keeping the earlier one",
                    frame.sequence(),
                    frame.timestamp()
                );
            }
        });
        self.subscription = Some(id);
        self.state = RecorderState::Recording;
        info!("Recording started");
        true
    }

    /// Stop recording. Once this returns no further frame reaches the store.
    #[instrument(skip(self))]
    pub fn stop(&mut self) {
        if self.state != RecorderState::Recording {
            return;
        }
        if let (Some(grabber), Some(id)) = (self.grabber.as_ref(), self.subscription.take()) {
            grabber.unsubscribe(id);
        }
        self.state = RecorderState::Ready;
        info!(
            "Recording stopped: {} frames over {:?}",
            self.store.len(),
            self.duration()
        );
    }

    /// Hand the recorded frames to `archive`, passing through `Saving`
    pub fn save(&mut self, archive: &mut dyn RecordingArchive) -> Result<usize> {
        let previous = self.begin(RecorderState::Saving, "save")?;

        let frames = self.store.frames();
        let result = archive.save(&frames);
        self.state = previous;

        match result {
            Ok(()) => {
                info!("Saved {} frames", frames.len());
                Ok(frames.len())
            }
            Err(e) => {
                error!("Failed to save recording: {}", e);
                Err(e)
            }
        }
    }

    /// Replace the store with frames from `archive`, passing through `Loading`
    pub fn load(&mut self, archive: &mut dyn RecordingArchive) -> Result<usize> {
        let previous = self.begin(RecorderState::Loading, "load")?;

        let result = archive.load();
        self.state = previous;

        match result {
            Ok(frames) => {
                let kept = self.store.replace(frames);
                info!("Loaded {} frames", kept);
                Ok(kept)
            }
            Err(e) => {
                error!("Failed to load recording: {}", e);
                Err(e)
            }
        }
    }

    fn begin(&mut self, next: RecorderState, action: &'static str) -> Result<RecorderState> {
        if self.state.is_busy() {
            error!("Cannot {} while {}", action, self.state);
            return Err(Error::InvalidStateTransition {
                state: self.state.label(),
                action,
            });
        }
        Ok(std::mem::replace(&mut self.state, next))
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn has_grabber(&self) -> bool {
        self.grabber.is_some()
    }

    pub fn grabber(&self) -> Option<&GrabberHandle> {
        self.grabber.as_ref()
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    pub fn first_timestamp(&self) -> Duration {
        self.store.first_timestamp()
    }

    pub fn last_timestamp(&self) -> Duration {
        self.store.last_timestamp()
    }

    pub fn duration(&self) -> Duration {
        self.store.duration()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn get(&self, timestamp: Duration) -> Option<Arc<Frame>> {
        self.store.get(timestamp)
    }

    /// Recorded frames in ascending timestamp order
    pub fn frames(&self) -> Vec<Arc<Frame>> {
        self.store.frames()
    }

    pub fn duplicate_count(&self) -> usize {
        self.store.duplicates()
    }

    /// Drop all recorded frames. Rejected while recording, saving or loading.
    pub fn clear(&mut self) -> bool {
        if self.state.is_busy() {
            error!("Cannot clear recorder while {}", self.state);
            return false;
        }
        self.store.clear();
        true
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{Emitter, SyntheticDevice};
    use crate::capture::{PixelBuffer, PixelFormat};
    use crate::grabber::Grabber;
    use crate::SyntheticConfig;

    fn grabber() -> (Grabber<SyntheticDevice>, Emitter) {
        let device = SyntheticDevice::new(SyntheticConfig {
            width: 4,
            height: 4,
            ..SyntheticConfig::default()
        });
        let emitter = device.emitter();
        (Grabber::new(device), emitter)
    }

    fn pixels() -> PixelBuffer {
        PixelBuffer::new(vec![0u8; 16], 4, 4, PixelFormat::Mono8)
    }

    #[derive(Default)]
    struct MemoryArchive {
        saved: Vec<Arc<Frame>>,
        fail: bool,
    }

    impl RecordingArchive for MemoryArchive {
        fn save(&mut self, frames: &[Arc<Frame>]) -> Result<()> {
            if self.fail {
                return Err(Error::Archive("disk full".into()));
            }
            self.saved = frames.to_vec();
            Ok(())
        }

        fn load(&mut self) -> Result<Vec<Arc<Frame>>> {
            if self.fail {
                return Err(Error::Archive("missing".into()));
            }
            Ok(self.saved.clone())
        }
    }

    #[test]
    fn test_state_labels() {
        let labels: Vec<_> = [
            RecorderState::NoGrabber,
            RecorderState::GrabberNotReady,
            RecorderState::Ready,
            RecorderState::Recording,
            RecorderState::Saving,
            RecorderState::Loading,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(
            labels,
            [
                "No grabber",
                "Grabber not ready",
                "Ready",
                "Recording",
                "Saving",
                "Loading"
            ]
        );
    }

    #[test]
    fn test_empty_recorder_sentinel() {
        let recorder = Recorder::new();
        assert_eq!(recorder.first_timestamp(), Duration::ZERO);
        assert_eq!(recorder.last_timestamp(), Duration::from_nanos(1));
        assert_eq!(recorder.duration(), Duration::from_nanos(1));
    }

    #[test]
    fn test_start_without_grabber_is_rejected() {
        let mut recorder = Recorder::new();
        assert!(!recorder.start());
        assert_eq!(recorder.state(), RecorderState::NoGrabber);
        assert!(!recorder.has_grabber());
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_start_with_closed_grabber() {
        let (grabber, _) = grabber();
        let mut recorder = Recorder::new();
        assert!(recorder.set_grabber(grabber.handle()));
        assert_eq!(recorder.state(), RecorderState::Ready);

        assert!(!recorder.start());
        assert_eq!(recorder.state(), RecorderState::GrabberNotReady);
        assert_eq!(grabber.handle().listener_count(), 0);
    }

    #[test]
    fn test_set_grabber_rejected_when_grabber_not_ready() {
        let (closed, _) = grabber();
        let (mut other, _) = grabber();
        other.open(0);

        let mut recorder = Recorder::new();
        recorder.set_grabber(closed.handle());
        assert!(!recorder.start());
        assert_eq!(recorder.state(), RecorderState::GrabberNotReady);

        assert!(!recorder.set_grabber(other.handle()));
        assert_eq!(recorder.state(), RecorderState::GrabberNotReady);
        assert!(!recorder.grabber().expect("bound").is_device_open());
    }

    #[test]
    fn test_rearm_after_grabber_opens() {
        let (mut grabber, _) = grabber();
        let mut recorder = Recorder::new();
        assert!(!recorder.rearm());
        assert_eq!(recorder.state(), RecorderState::NoGrabber);

        recorder.set_grabber(grabber.handle());
        assert!(!recorder.rearm());
        recorder.start();
        assert_eq!(recorder.state(), RecorderState::GrabberNotReady);

        grabber.open(0);
        assert!(recorder.rearm());
        assert_eq!(recorder.state(), RecorderState::Ready);
        assert!(recorder.start());
        assert_eq!(grabber.handle().listener_count(), 1);
    }

    #[test]
    fn test_set_grabber_rejected_while_recording() {
        let (mut first, _) = grabber();
        let (mut second, _) = grabber();
        first.open(0);
        second.open(1);

        let mut recorder = Recorder::new();
        recorder.set_grabber(first.handle());
        assert!(recorder.start());

        assert!(!recorder.set_grabber(second.handle()));
        assert_eq!(recorder.state(), RecorderState::Recording);
        assert_eq!(first.handle().listener_count(), 1);
        assert_eq!(second.handle().listener_count(), 0);
    }

    #[test]
    fn test_records_in_timestamp_order() {
        let (mut grabber, emitter) = grabber();
        grabber.open(0);
        let mut recorder = Recorder::new();
        recorder.set_grabber(grabber.handle());
        assert!(recorder.start());

        for nanos in [100, 50, 200] {
            emitter.emit(Duration::from_nanos(nanos), pixels());
        }
        recorder.stop();

        assert_eq!(recorder.state(), RecorderState::Ready);
        assert_eq!(recorder.len(), 3);
        assert_eq!(recorder.first_timestamp(), Duration::from_nanos(50));
        assert_eq!(recorder.last_timestamp(), Duration::from_nanos(200));
        assert_eq!(recorder.duration(), Duration::from_nanos(150));
    }

    #[test]
    fn test_stop_unsubscribes() {
        let (mut grabber, emitter) = grabber();
        grabber.open(0);
        let mut recorder = Recorder::new();
        recorder.set_grabber(grabber.handle());
        recorder.start();
        emitter.emit(Duration::from_nanos(1), pixels());
        recorder.stop();
        emitter.emit(Duration::from_nanos(2), pixels());

        assert_eq!(recorder.len(), 1);
        assert_eq!(grabber.handle().listener_count(), 0);

        // Stopping again is a no-op
        recorder.stop();
        assert_eq!(recorder.state(), RecorderState::Ready);
    }

    #[test]
    fn test_restart_does_not_double_subscribe() {
        let (mut grabber, emitter) = grabber();
        grabber.open(0);
        let mut recorder = Recorder::new();
        recorder.set_grabber(grabber.handle());
        recorder.start();
        recorder.start();
        assert_eq!(grabber.handle().listener_count(), 1);

        emitter.emit(Duration::from_nanos(9), pixels());
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.duplicate_count(), 0);
    }

    #[test]
    fn test_save_and_load_round_through_states() {
        let (mut grabber, emitter) = grabber();
        grabber.open(0);
        let mut recorder = Recorder::new();
        recorder.set_grabber(grabber.handle());
        recorder.start();
        emitter.emit(Duration::from_nanos(30), pixels());
        emitter.emit(Duration::from_nanos(10), pixels());

        let mut archive = MemoryArchive::default();
        assert!(matches!(
            recorder.save(&mut archive),
            Err(Error::InvalidStateTransition { .. })
        ));

        recorder.stop();
        assert_eq!(recorder.save(&mut archive).expect("save"), 2);
        assert_eq!(recorder.state(), RecorderState::Ready);
        assert_eq!(archive.saved[0].timestamp(), Duration::from_nanos(10));

        assert!(recorder.clear());
        assert!(recorder.is_empty());
        assert_eq!(recorder.load(&mut archive).expect("load"), 2);
        assert_eq!(recorder.state(), RecorderState::Ready);
        assert_eq!(recorder.last_timestamp(), Duration::from_nanos(30));
    }

    #[test]
    fn test_archive_failure_restores_state() {
        let mut recorder = Recorder::new();
        let mut archive = MemoryArchive {
            fail: true,
            ..MemoryArchive::default()
        };
        assert!(recorder.load(&mut archive).is_err());
        assert_eq!(recorder.state(), RecorderState::NoGrabber);
        assert!(recorder.save(&mut archive).is_err());
        assert_eq!(recorder.state(), RecorderState::NoGrabber);
    }
}
