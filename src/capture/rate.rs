//! Per-grabber frame rate tracking

use std::time::{Duration, Instant};

/// Smoothing factor for the exponential moving average
const SMOOTHING: f64 = 0.1;

/// Interval and smoothed rate between consecutive frames of one grabber
#[derive(Debug, Clone, Default)]
pub struct FrameRate {
    last: Option<Instant>,
    fps: f64,
}

impl FrameRate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame arrival. Returns the interval since the previous one.
    pub fn tick(&mut self, now: Instant) -> Option<Duration> {
        let last = self.last.replace(now)?;
        let interval = now.saturating_duration_since(last);

        let secs = interval.as_secs_f64();
        if secs > 0.0 {
            let instant_fps = 1.0 / secs;
            self.fps = if self.fps == 0.0 {
                instant_fps
            } else {
                self.fps + SMOOTHING * (instant_fps - self.fps)
            };
        }
        Some(interval)
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
