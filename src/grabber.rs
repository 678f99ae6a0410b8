//! Grabber: bridges a device capture thread to a once-per-cycle consumer
//!
//! The device pushes frames into a [`FrameSink`] from its own thread. The
//! consumer calls [`Grabber::update`] once per cycle and then reads the
//! current pixels. At most one new frame becomes visible per cycle; frames
//! arriving faster than that replace each other in the waiting slot.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::device::{BlockingCapture, Feature, Roi, TriggerMode, TriggerSignalType};
use crate::capture::rate::FrameRate;
use crate::capture::{Frame, PixelBuffer};
use crate::pipeline::swap::{StoreOutcome, SwapBuffer};
use crate::{Error, Result};

/// Device lifecycle as seen by the grabber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    Closed = 0,
    Running = 1,
    /// Terminal; entered right before teardown
    Deleting = 2,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceState::Running,
            2 => DeviceState::Deleting,
            _ => DeviceState::Closed,
        }
    }
}

/// Identifies a new-frame listener registered on a grabber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type FrameListener = Arc<dyn Fn(&Arc<Frame>) + Send + Sync>;

/// Grabber counters and rate
#[derive(Debug, Clone, Copy, Default)]
pub struct GrabberStats {
    pub capture_fps: f64,
    pub frames_received: usize,
    pub frames_displayed: usize,
    pub frames_dropped: usize,
    pub frames_suppressed: usize,
}

/// State shared between the grabber, its device and its handles
struct Shared {
    state: AtomicU8,
    buffer: SwapBuffer,
    listeners: RwLock<Vec<(ListenerId, FrameListener)>>,
    next_listener: AtomicU64,
    rate: Mutex<FrameRate>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(DeviceState::Closed as u8),
            buffer: SwapBuffer::new(),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            rate: Mutex::new(FrameRate::new()),
        }
    }

    fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Deleting is never left once entered
    fn set_state(&self, state: DeviceState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != DeviceState::Deleting as u8).then_some(state as u8)
            });
    }

    fn fps(&self) -> f64 {
        self.rate.lock().unwrap_or_else(PoisonError::into_inner).fps()
    }

    fn stats(&self) -> GrabberStats {
        let swap = self.buffer.stats();
        GrabberStats {
            capture_fps: self.fps(),
            frames_received: swap.frames_written,
            frames_displayed: swap.frames_read,
            frames_dropped: swap.frames_dropped,
            frames_suppressed: swap.frames_rejected,
        }
    }
}

/// New-frame notification target handed to the device.
///
/// [`FrameSink::deliver`] runs on the device's capture thread.
#[derive(Clone)]
pub struct FrameSink {
    shared: Arc<Shared>,
}

impl FrameSink {
    /// Hand a freshly captured frame to the grabber.
    ///
    /// Holds the frame's read lock and the buffer lock only while the pixel
    /// handle is moved into the waiting slot. Never blocks on I/O.
    pub fn deliver(&self, frame: Arc<Frame>) {
        let shared = &self.shared;
        if shared.state() == DeviceState::Deleting {
            metrics::counter!("framegrab_frames_suppressed_total").increment(1);
            return;
        }

        let outcome = {
            let pixels = frame.lock_for_reading();
            shared.buffer.store(&pixels)
        };

        match outcome {
            StoreOutcome::Rejected => {
                trace!("Frame {} arrived while detached", frame.sequence());
                metrics::counter!("framegrab_frames_suppressed_total").increment(1);
                return;
            }
            StoreOutcome::Replaced => {
                metrics::counter!("framegrab_frames_dropped_total").increment(1);
            }
            StoreOutcome::Stored => {}
        }
        metrics::counter!("framegrab_frames_received_total").increment(1);

        {
            let mut rate = shared.rate.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(interval) = rate.tick(Instant::now()) {
                trace!(
                    "Frame captured in {:?}\t{:.1} fps",
                    interval,
                    rate.fps()
                );
                metrics::gauge!("framegrab_capture_fps").set(rate.fps());
            }
        }

        let listeners = shared
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, listener) in listeners.iter() {
            listener(&frame);
        }
    }
}

/// Cloneable, thread-safe view of a grabber used by recorders and monitors
#[derive(Clone)]
pub struct GrabberHandle {
    shared: Arc<Shared>,
}

impl GrabberHandle {
    pub fn state(&self) -> DeviceState {
        self.shared.state()
    }

    pub fn is_device_open(&self) -> bool {
        self.shared.state() == DeviceState::Running
    }

    pub fn has_frame_waiting(&self) -> bool {
        self.shared.buffer.has_fresh()
    }

    pub fn stats(&self) -> GrabberStats {
        self.shared.stats()
    }

    /// Register a callback fired with every frame the grabber accepts.
    ///
    /// The callback runs on the device's capture thread and must not
    /// subscribe or unsubscribe from inside itself.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Arc<Frame>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        debug!("Listener {:?} subscribed", id);
        id
    }

    /// Remove a listener. Waits for any dispatch already running on the
    /// capture thread, so the listener is never called after this returns.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if removed {
            debug!("Listener {:?} unsubscribed", id);
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.shared
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Owns a device and the double buffer in front of it
pub struct Grabber<D: BlockingCapture> {
    device: D,
    shared: Arc<Shared>,
    /// Consumer slot, only touched from `update` and the accessors
    pixels: PixelBuffer,
    current_frame_new: bool,
    capturing: bool,
}

impl<D: BlockingCapture> Grabber<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            shared: Arc::new(Shared::new()),
            pixels: PixelBuffer::default(),
            current_frame_new: false,
            capturing: false,
        }
    }

    /// Open the device, closing any current session first.
    ///
    /// Failures are logged and leave the grabber `Closed`.
    #[instrument(skip(self))]
    pub fn open(&mut self, device_id: u32) {
        self.close();

        if let Err(e) = self.device.open(device_id) {
            error!("{}", e);
            self.shared.set_state(DeviceState::Closed);
            return;
        }

        let spec = self.device.specification();
        if !spec.is_valid() {
            error!("Device {} reported an invalid specification", device_id);
            self.device.close();
            self.shared.set_state(DeviceState::Closed);
            return;
        }
        info!(
            "Opened device {}: {} {} ({}x{})",
            device_id, spec.manufacturer, spec.model, spec.sensor_width, spec.sensor_height
        );

        self.shared.buffer.attach();
        self.device.set_frame_sink(Some(FrameSink {
            shared: Arc::clone(&self.shared),
        }));
        self.shared.set_state(DeviceState::Running);
    }

    /// Stop and close the device. No-op when already closed.
    #[instrument(skip(self))]
    pub fn close(&mut self) {
        if !self.is_device_open() {
            return;
        }
        self.shutdown_device();
        self.shared.set_state(DeviceState::Closed);
        info!("Device closed");
    }

    fn shutdown_device(&mut self) {
        if self.capturing {
            if let Err(e) = self.device.stop_free_run() {
                warn!("Failed to stop free run while closing: {}", e);
            }
            self.capturing = false;
        }
        self.shared.buffer.detach();
        self.device.set_frame_sink(None);
        self.device.close();
        self.shared
            .rate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
    }

    /// Apply the trigger configuration and start free-run capture
    #[instrument(skip(self))]
    pub fn start_capture(
        &mut self,
        trigger_mode: TriggerMode,
        trigger_signal: TriggerSignalType,
    ) -> Result<()> {
        self.require_open("start capture")?;

        // Free run needs no trigger configuration on devices that cannot trigger
        if trigger_mode != TriggerMode::FreeRun
            || self.device.specification().supports(Feature::Triggering)
        {
            self.set_trigger_mode(trigger_mode, trigger_signal)?;
        }

        self.device.start_free_run().map_err(|e| {
            error!("Failed to start capture: {}", e);
            e
        })?;
        self.capturing = true;
        info!("Capture started ({:?})", trigger_mode);
        Ok(())
    }

    /// Stop free-run capture; the device stays open
    #[instrument(skip(self))]
    pub fn stop_capture(&mut self) -> Result<()> {
        self.require_open("stop capture")?;

        self.device.stop_free_run().map_err(|e| {
            error!("Failed to stop capture: {}", e);
            e
        })?;
        self.capturing = false;
        info!("Capture stopped");
        Ok(())
    }

    /// Call once per consumer cycle, before reading `is_frame_new` or pixels
    pub fn update(&mut self) {
        self.current_frame_new = self.shared.buffer.swap_into(&mut self.pixels);
    }

    /// Whether the last `update` swapped in a new frame
    pub fn is_frame_new(&self) -> bool {
        self.current_frame_new
    }

    /// Most recent frame swapped in by `update`
    pub fn pixels(&self) -> &PixelBuffer {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn set_binning(&mut self, binning_x: u32, binning_y: u32) -> Result<()> {
        self.require_open("set binning")?;
        self.require_feature(Feature::Binning)?;
        self.device
            .set_binning(binning_x, binning_y)
            .map_err(|e| {
                error!("Failed to set binning: {}", e);
                e
            })
    }

    pub fn set_roi(&mut self, roi: Roi) -> Result<()> {
        self.require_open("set ROI")?;
        self.require_feature(Feature::Roi)?;
        self.device
            .set_roi(roi)
            .map_err(|e| {
                error!("Failed to set ROI: {}", e);
                e
            })
    }

    pub fn set_trigger_mode(
        &mut self,
        trigger_mode: TriggerMode,
        trigger_signal: TriggerSignalType,
    ) -> Result<()> {
        self.require_open("set trigger mode")?;
        self.require_feature(Feature::Triggering)?;

        let spec = self.device.specification();
        if !spec.supports_trigger_mode(trigger_mode) {
            error!("Trigger mode {:?} is not supported", trigger_mode);
            return Err(Error::UnsupportedTriggerMode(trigger_mode));
        }
        if !spec.supports_signal_type(trigger_signal) {
            error!("Trigger signal {:?} is not supported", trigger_signal);
            return Err(Error::UnsupportedSignalType(trigger_signal));
        }

        self.device
            .set_trigger_mode(trigger_mode, trigger_signal)
            .map_err(|e| {
                error!("Failed to set trigger mode: {}", e);
                e
            })
    }

    fn require_open(&self, action: &str) -> Result<()> {
        if self.is_device_open() {
            Ok(())
        } else {
            error!("Cannot {}: device is not open", action);
            Err(Error::NotOpen)
        }
    }

    fn require_feature(&self, feature: Feature) -> Result<()> {
        if self.device.specification().supports(feature) {
            Ok(())
        } else {
            error!("Device does not support {:?}", feature);
            Err(Error::UnsupportedFeature(feature))
        }
    }

    pub fn state(&self) -> DeviceState {
        self.shared.state()
    }

    pub fn is_device_open(&self) -> bool {
        self.shared.state() == DeviceState::Running
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn frame_rate(&self) -> f64 {
        self.shared.fps()
    }

    pub fn stats(&self) -> GrabberStats {
        self.shared.stats()
    }

    pub fn handle(&self) -> GrabberHandle {
        GrabberHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D: BlockingCapture> Drop for Grabber<D> {
    fn drop(&mut self) {
        let was_open = self.is_device_open();

        // Callbacks check this before touching the buffers
        self.shared
            .state
            .store(DeviceState::Deleting as u8, Ordering::Release);
        self.shared.buffer.seal();

        if was_open {
            self.shutdown_device();
        }
        debug!("Grabber torn down");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::capture::device::Specification;
    use crate::capture::synthetic::{Emitter, SyntheticDevice};
    use crate::capture::PixelFormat;
    use crate::SyntheticConfig;

    fn small_config() -> SyntheticConfig {
        SyntheticConfig {
            width: 8,
            height: 4,
            fps: 100,
            ..SyntheticConfig::default()
        }
    }

    fn solid(fill: u8) -> PixelBuffer {
        PixelBuffer::new(vec![fill; 32], 8, 4, PixelFormat::Mono8)
    }

    fn open_grabber() -> (Grabber<SyntheticDevice>, Emitter) {
        let device = SyntheticDevice::new(small_config());
        let emitter = device.emitter();
        let mut grabber = Grabber::new(device);
        grabber.open(0);
        assert!(grabber.is_device_open());
        (grabber, emitter)
    }

    #[test]
    fn test_open_and_close() {
        let (mut grabber, _) = open_grabber();
        assert_eq!(grabber.state(), DeviceState::Running);

        grabber.close();
        assert_eq!(grabber.state(), DeviceState::Closed);

        // Closing twice is a no-op
        grabber.close();
        assert_eq!(grabber.state(), DeviceState::Closed);
    }

    #[test]
    fn test_open_failure_leaves_closed() {
        let mut grabber = Grabber::new(SyntheticDevice::new(small_config()).failing());
        grabber.open(3);
        assert_eq!(grabber.state(), DeviceState::Closed);
    }

    #[test]
    fn test_invalid_specification_leaves_closed() {
        let config = SyntheticConfig {
            width: 0,
            ..small_config()
        };
        let mut grabber = Grabber::new(SyntheticDevice::new(config));
        grabber.open(0);
        assert_eq!(grabber.state(), DeviceState::Closed);
    }

    #[test]
    fn test_reopen_closes_previous_session() {
        let (mut grabber, emitter) = open_grabber();
        grabber.start_capture(TriggerMode::Software, TriggerSignalType::RisingEdge).expect("start");
        assert!(grabber.is_capturing());

        grabber.open(1);
        assert!(grabber.is_device_open());
        assert!(!grabber.is_capturing());
        assert!(emitter.emit(Duration::from_nanos(1), solid(1)));
    }

    #[test]
    fn test_capture_requires_open() {
        let mut grabber = Grabber::new(SyntheticDevice::new(small_config()));
        let err = grabber
            .start_capture(TriggerMode::FreeRun, TriggerSignalType::RisingEdge)
            .unwrap_err();
        assert!(matches!(err, Error::NotOpen));
        assert!(matches!(grabber.stop_capture().unwrap_err(), Error::NotOpen));
        assert!(matches!(grabber.set_binning(2, 2).unwrap_err(), Error::NotOpen));
    }

    #[test]
    fn test_unsupported_features() {
        let mut spec = Specification {
            manufacturer: "test".into(),
            model: "bare".into(),
            sensor_width: 8,
            sensor_height: 4,
            ..Specification::default()
        };
        spec.trigger_modes = HashSet::from([TriggerMode::FreeRun]);
        let device = SyntheticDevice::new(small_config()).with_specification(spec);
        let mut grabber = Grabber::new(device);
        grabber.open(0);

        assert!(matches!(
            grabber.set_binning(2, 2).unwrap_err(),
            Error::UnsupportedFeature(Feature::Binning)
        ));
        assert!(matches!(
            grabber.set_roi(Roi::new(0, 0, 4, 4)).unwrap_err(),
            Error::UnsupportedFeature(Feature::Roi)
        ));
        assert!(matches!(
            grabber
                .set_trigger_mode(TriggerMode::Software, TriggerSignalType::RisingEdge)
                .unwrap_err(),
            Error::UnsupportedFeature(Feature::Triggering)
        ));

        // Free run still starts without trigger support
        grabber
            .start_capture(TriggerMode::FreeRun, TriggerSignalType::RisingEdge)
            .expect("free run");
        grabber.stop_capture().expect("stop");
    }

    #[test]
    fn test_unsupported_trigger_mode() {
        let mut spec = SyntheticDevice::default_specification(8, 4);
        spec.trigger_modes.remove(&TriggerMode::External);
        let mut grabber =
            Grabber::new(SyntheticDevice::new(small_config()).with_specification(spec));
        grabber.open(0);

        assert!(matches!(
            grabber
                .set_trigger_mode(TriggerMode::External, TriggerSignalType::FallingEdge)
                .unwrap_err(),
            Error::UnsupportedTriggerMode(TriggerMode::External)
        ));
    }

    #[test]
    fn test_update_without_frames() {
        let (mut grabber, _) = open_grabber();
        grabber.update();
        assert!(!grabber.is_frame_new());
        assert!(grabber.pixels().is_empty());
    }

    #[test]
    fn test_single_frame_visible_for_one_cycle() {
        let (mut grabber, emitter) = open_grabber();
        emitter.emit(Duration::from_nanos(10), solid(4));

        grabber.update();
        assert!(grabber.is_frame_new());
        assert_eq!(grabber.pixels().data(), &[4u8; 32][..]);
        assert_eq!(grabber.width(), 8);
        assert_eq!(grabber.height(), 4);

        grabber.update();
        assert!(!grabber.is_frame_new());
        assert_eq!(grabber.pixels().data(), &[4u8; 32][..]);
    }

    #[test]
    fn test_only_latest_frame_between_cycles() {
        let (mut grabber, emitter) = open_grabber();
        for fill in 1..=5u8 {
            emitter.emit(Duration::from_nanos(u64::from(fill)), solid(fill));
        }

        grabber.update();
        assert!(grabber.is_frame_new());
        assert_eq!(grabber.pixels().data(), &[5u8; 32][..]);

        grabber.update();
        assert!(!grabber.is_frame_new());

        let stats = grabber.stats();
        assert_eq!(stats.frames_received, 5);
        assert_eq!(stats.frames_dropped, 4);
        assert_eq!(stats.frames_displayed, 1);
    }

    #[test]
    fn test_concurrent_delivery_never_tears() {
        let (mut grabber, emitter) = open_grabber();

        let producer = thread::spawn(move || {
            for i in 0..2_000u64 {
                let fill = (i % 251) as u8;
                emitter.emit(Duration::from_nanos(i + 1), solid(fill));
            }
        });

        let mut seen = 0;
        while !producer.is_finished() {
            grabber.update();
            if grabber.is_frame_new() {
                seen += 1;
                let data = grabber.pixels().data();
                assert_eq!(data.len(), 32);
                assert!(data.iter().all(|&b| b == data[0]), "torn frame");
            }
        }
        producer.join().expect("producer");

        grabber.update();
        assert!(seen > 0 || grabber.is_frame_new());
        let stats = grabber.stats();
        assert_eq!(stats.frames_received, 2_000);
        assert!(stats.frames_displayed <= 2_000);
    }

    #[test]
    fn test_closed_grabber_ignores_frames() {
        let (mut grabber, emitter) = open_grabber();
        let handle = grabber.handle();
        let sink = FrameSink {
            shared: Arc::clone(&grabber.shared),
        };
        grabber.close();

        // The device no longer has a sink, and a stale one is refused
        assert!(!emitter.emit(Duration::from_nanos(1), solid(1)));
        sink.deliver(Arc::new(Frame::new(Duration::from_nanos(2), 0, solid(2))));
        assert!(!handle.has_frame_waiting());
        assert_eq!(handle.stats().frames_suppressed, 1);
    }

    #[test]
    fn test_teardown_suppresses_callbacks() {
        let (grabber, _) = open_grabber();
        let handle = grabber.handle();
        let sink = FrameSink {
            shared: Arc::clone(&grabber.shared),
        };
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        handle.subscribe(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        drop(grabber);
        assert_eq!(handle.state(), DeviceState::Deleting);

        sink.deliver(Arc::new(Frame::new(Duration::from_nanos(5), 0, solid(9))));
        assert!(!handle.has_frame_waiting());
        assert_eq!(handle.stats().frames_received, 0);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_listeners_receive_frames() {
        let (grabber, emitter) = open_grabber();
        let handle = grabber.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = handle.subscribe(move |frame| {
            sink.lock().expect("lock").push(frame.timestamp());
        });

        emitter.emit(Duration::from_nanos(7), solid(1));
        assert!(handle.unsubscribe(id));
        assert!(!handle.unsubscribe(id));
        emitter.emit(Duration::from_nanos(8), solid(2));

        assert_eq!(*seen.lock().expect("lock"), vec![Duration::from_nanos(7)]);
        assert_eq!(handle.listener_count(), 0);
    }

    #[test]
    fn test_frame_rate_is_per_grabber() {
        let (first, first_emitter) = open_grabber();
        let (second, _) = open_grabber();

        for i in 0..3u64 {
            first_emitter.emit(Duration::from_millis(i), solid(1));
            thread::sleep(Duration::from_millis(2));
        }

        assert!(first.frame_rate() > 0.0);
        assert_eq!(second.frame_rate(), 0.0);
    }
}
