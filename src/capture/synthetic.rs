//! Synthetic test-pattern device with its own capture thread
//!
//! Stands in for a camera driver: frames are generated on a dedicated
//! thread and pushed into the attached [`FrameSink`], either continuously at
//! the configured rate or on each software trigger.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use flume::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capture::device::{
    BlockingCapture, Feature, Roi, Specification, TriggerMode, TriggerSignalType,
};
use crate::capture::{Frame, PixelBuffer, PixelFormat};
use crate::grabber::FrameSink;
use crate::{Error, Result, SyntheticConfig};

/// Test patterns the synthetic device can render
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pattern {
    /// Horizontal gradient that scrolls one column per frame
    #[default]
    Gradient,
    Checkerboard,
    Solid(u8),
    /// Every pixel holds the low byte of the frame sequence number
    Sequence,
}

enum Command {
    Trigger,
    Stop,
}

struct Worker {
    control: Sender<Command>,
    handle: JoinHandle<()>,
}

/// Frame geometry at the time capture was started
#[derive(Debug, Clone, Copy)]
struct Geometry {
    roi: Roi,
    binning_x: u32,
    binning_y: u32,
}

impl Geometry {
    fn output_size(&self) -> (u32, u32) {
        (
            (self.roi.width / self.binning_x).max(1),
            (self.roi.height / self.binning_y).max(1),
        )
    }
}

/// Pushes frames into whatever sink the device currently has attached.
///
/// Calling [`Emitter::emit`] from any thread behaves like the driver's
/// capture thread delivering a frame.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<ArcSwapOption<FrameSink>>,
    sequence: Arc<AtomicU64>,
}

impl Emitter {
    /// Deliver one frame. Returns false when no sink is attached.
    pub fn emit(&self, timestamp: Duration, pixels: PixelBuffer) -> bool {
        let sink = self.sink.load_full();
        let Some(sink) = sink else {
            return false;
        };

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let frame = Arc::new(Frame::new(timestamp, sequence, PixelBuffer::default()));
        *frame.lock_for_writing() = pixels;

        sink.deliver(frame);
        true
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

pub struct SyntheticDevice {
    config: SyntheticConfig,
    specification: Specification,
    emitter: Emitter,
    worker: Option<Worker>,
    opened: Option<u32>,
    epoch: Instant,
    fail_open: bool,
    geometry: Geometry,
    trigger_mode: TriggerMode,
    trigger_signal: TriggerSignalType,
}

impl SyntheticDevice {
    pub fn new(config: SyntheticConfig) -> Self {
        let specification = Self::default_specification(config.width, config.height);
        Self {
            geometry: Geometry {
                roi: Roi::new(0, 0, config.width, config.height),
                binning_x: 1,
                binning_y: 1,
            },
            config,
            specification,
            emitter: Emitter {
                sink: Arc::new(ArcSwapOption::empty()),
                sequence: Arc::new(AtomicU64::new(0)),
            },
            worker: None,
            opened: None,
            epoch: Instant::now(),
            fail_open: false,
            trigger_mode: TriggerMode::FreeRun,
            trigger_signal: TriggerSignalType::RisingEdge,
        }
    }

    /// Full capability set for a sensor of the given size
    pub fn default_specification(width: u32, height: u32) -> Specification {
        Specification {
            manufacturer: "framegrab".into(),
            model: "Synthetic".into(),
            sensor_width: width,
            sensor_height: height,
            features: HashSet::from([Feature::Binning, Feature::Roi, Feature::Triggering]),
            trigger_modes: HashSet::from([
                TriggerMode::FreeRun,
                TriggerMode::Software,
                TriggerMode::External,
            ]),
            signal_types: HashSet::from([
                TriggerSignalType::RisingEdge,
                TriggerSignalType::FallingEdge,
                TriggerSignalType::WhenHigh,
                TriggerSignalType::WhenLow,
            ]),
        }
    }

    /// Report `specification` instead of the default capability set
    #[must_use]
    pub fn with_specification(mut self, specification: Specification) -> Self {
        self.specification = specification;
        self
    }

    /// Make every `open` fail
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Handle for pushing frames as if from the capture thread
    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    pub fn is_open(&self) -> bool {
        self.opened.is_some()
    }

    pub fn is_free_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn trigger_mode(&self) -> (TriggerMode, TriggerSignalType) {
        (self.trigger_mode, self.trigger_signal)
    }

    pub fn roi(&self) -> Roi {
        self.geometry.roi
    }

    pub fn binning(&self) -> (u32, u32) {
        (self.geometry.binning_x, self.geometry.binning_y)
    }

    /// Software trigger: capture one frame now
    pub fn trigger(&self) -> Result<()> {
        let worker = self.worker.as_ref().ok_or(Error::NotOpen)?;
        worker
            .control
            .send(Command::Trigger)
            .map_err(|_| Error::Driver("capture thread has exited".into()))
    }

    fn frame_interval(&self) -> Option<Duration> {
        match self.trigger_mode {
            TriggerMode::FreeRun if self.config.fps > 0 => {
                Some(Duration::from_secs(1) / self.config.fps)
            }
            TriggerMode::FreeRun | TriggerMode::Software | TriggerMode::External => None,
        }
    }

    fn stop_worker(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        // The thread also exits when the channel disconnects
        let _ = worker.control.send(Command::Stop);
        worker
            .handle
            .join()
            .map_err(|_| Error::Driver("capture thread panicked".into()))
    }
}

impl BlockingCapture for SyntheticDevice {
    fn open(&mut self, device_id: u32) -> Result<()> {
        if self.fail_open {
            return Err(Error::DeviceOpenFailure {
                device_id,
                reason: "synthetic failure".into(),
            });
        }
        if self.opened.is_some() {
            self.close();
        }

        self.opened = Some(device_id);
        self.epoch = Instant::now();
        self.geometry = Geometry {
            roi: Roi::new(0, 0, self.config.width, self.config.height),
            binning_x: 1,
            binning_y: 1,
        };
        debug!("Synthetic device {} opened", device_id);
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.stop_worker() {
            warn!("{}", e);
        }
        if let Some(device_id) = self.opened.take() {
            debug!("Synthetic device {} closed", device_id);
        }
    }

    fn specification(&self) -> &Specification {
        &self.specification
    }

    fn start_free_run(&mut self) -> Result<()> {
        let device_id = self.opened.ok_or(Error::NotOpen)?;
        if self.worker.is_some() {
            return Ok(());
        }

        let (control, commands) = flume::unbounded();
        let emitter = self.emitter.clone();
        let renderer = Renderer {
            pattern: self.config.pattern,
            geometry: self.geometry,
        };
        let interval = self.frame_interval();
        let epoch = self.epoch;

        let handle = thread::Builder::new()
            .name(format!("synthetic-capture-{}", device_id))
            .spawn(move || capture_loop(commands, emitter, renderer, interval, epoch))
            .map_err(|e| Error::Driver(format!("failed to spawn capture thread: {}", e)))?;

        self.worker = Some(Worker { control, handle });
        info!("Synthetic device {} capturing ({:?})", device_id, self.trigger_mode);
        Ok(())
    }

    fn stop_free_run(&mut self) -> Result<()> {
        self.opened.ok_or(Error::NotOpen)?;
        self.stop_worker()
    }

    fn set_binning(&mut self, binning_x: u32, binning_y: u32) -> Result<()> {
        if binning_x == 0 || binning_y == 0 {
            return Err(Error::Driver(format!(
                "invalid binning {}x{}",
                binning_x, binning_y
            )));
        }
        self.geometry.binning_x = binning_x;
        self.geometry.binning_y = binning_y;
        Ok(())
    }

    fn set_roi(&mut self, roi: Roi) -> Result<()> {
        if !roi.fits_within(self.config.width, self.config.height) {
            return Err(Error::Driver(format!("ROI {:?} exceeds the sensor", roi)));
        }
        self.geometry.roi = roi;
        Ok(())
    }

    fn set_trigger_mode(&mut self, mode: TriggerMode, signal: TriggerSignalType) -> Result<()> {
        // Takes effect at the next start_free_run
        self.trigger_mode = mode;
        self.trigger_signal = signal;
        Ok(())
    }

    fn set_frame_sink(&mut self, sink: Option<FrameSink>) {
        self.emitter.sink.store(sink.map(Arc::new));
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        let _ = self.stop_worker();
    }
}

struct Renderer {
    pattern: Pattern,
    geometry: Geometry,
}

impl Renderer {
    fn render(&self, sequence: u64) -> PixelBuffer {
        let (width, height) = self.geometry.output_size();
        let mut data = vec![0u8; width as usize * height as usize];

        match self.pattern {
            Pattern::Gradient => {
                let width = width as usize;
                let shift = sequence as usize % width;
                for row in data.chunks_mut(width) {
                    for (x, px) in row.iter_mut().enumerate() {
                        *px = ((x + shift) % width * 255 / width) as u8;
                    }
                }
            }
            Pattern::Checkerboard => {
                for (y, row) in data.chunks_mut(width as usize).enumerate() {
                    for (x, px) in row.iter_mut().enumerate() {
                        *px = if (x / 8 + y / 8) % 2 == 0 { 255 } else { 0 };
                    }
                }
            }
            Pattern::Solid(value) => data.fill(value),
            Pattern::Sequence => data.fill(sequence as u8),
        }

        PixelBuffer::new(data, width, height, PixelFormat::Mono8)
    }
}

fn capture_loop(
    commands: Receiver<Command>,
    emitter: Emitter,
    renderer: Renderer,
    interval: Option<Duration>,
    epoch: Instant,
) {
    loop {
        let command = match interval {
            Some(interval) => match commands.recv_timeout(interval) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        match command {
            Some(Command::Stop) => break,
            Some(Command::Trigger) | None => {
                let pixels = renderer.render(emitter.next_sequence());
                emitter.emit(epoch.elapsed(), pixels);
            }
        }
    }
    debug!("Capture thread exiting");
}
