//! Device contract consumed by the grabber

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::grabber::FrameSink;
use crate::Result;

/// Optional device capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    Binning,
    Roi,
    Triggering,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Device produces frames continuously
    #[default]
    FreeRun,
    Software,
    External,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerSignalType {
    #[default]
    RisingEdge,
    FallingEdge,
    WhenHigh,
    WhenLow,
}

/// Sensor sub-rectangle, in sensor pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.saturating_add(self.width) <= width
            && self.y.saturating_add(self.height) <= height
    }
}

/// What an opened device reports about itself
#[derive(Debug, Clone, Default)]
pub struct Specification {
    pub manufacturer: String,
    pub model: String,
    pub sensor_width: u32,
    pub sensor_height: u32,
    pub features: HashSet<Feature>,
    pub trigger_modes: HashSet<TriggerMode>,
    pub signal_types: HashSet<TriggerSignalType>,
}

impl Specification {
    /// A specification is valid once the device has reported a sensor size
    pub fn is_valid(&self) -> bool {
        self.sensor_width > 0 && self.sensor_height > 0
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    pub fn supports_trigger_mode(&self, mode: TriggerMode) -> bool {
        self.trigger_modes.contains(&mode)
    }

    pub fn supports_signal_type(&self, signal: TriggerSignalType) -> bool {
        self.signal_types.contains(&signal)
    }
}

/// A device that runs its own capture thread and pushes every frame it
/// produces into the attached [`FrameSink`].
///
/// Devices that expose a different capture style get their own trait, so a
/// grabber can only be built over a device kind it knows how to drive.
pub trait BlockingCapture: Send {
    fn open(&mut self, device_id: u32) -> Result<()>;

    fn close(&mut self);

    /// Only meaningful after a successful `open`
    fn specification(&self) -> &Specification;

    fn start_free_run(&mut self) -> Result<()>;

    fn stop_free_run(&mut self) -> Result<()>;

    fn set_binning(&mut self, binning_x: u32, binning_y: u32) -> Result<()>;

    fn set_roi(&mut self, roi: Roi) -> Result<()>;

    fn set_trigger_mode(&mut self, mode: TriggerMode, signal: TriggerSignalType) -> Result<()>;

    /// Attach or detach the new-frame notification target
    fn set_frame_sink(&mut self, sink: Option<FrameSink>);
}
