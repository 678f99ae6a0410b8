use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pixel formats we support
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    Mono8,
    Mono16,
    Rgb24,
    Bgr24,
    Yuyv4,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono16 | PixelFormat::Yuyv4 => 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        }
    }
}

/// Pixel storage with zero-copy semantics.
///
/// Cloning shares the underlying allocation, so moving a buffer between the
/// frame, the swap slot and the consumer never copies pixel data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PixelBuffer {
    data: Bytes,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl PixelBuffer {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A captured frame.
///
/// The timestamp is fixed at construction. The pixels sit behind a
/// reader/writer lock: the device writes them while filling the frame, the
/// grabber and recorder read them once it has been delivered.
#[derive(Debug)]
pub struct Frame {
    timestamp: Duration,
    sequence: u64,
    pixels: RwLock<PixelBuffer>,
}

impl Frame {
    pub fn new(timestamp: Duration, sequence: u64, pixels: PixelBuffer) -> Self {
        Self {
            timestamp,
            sequence,
            pixels: RwLock::new(pixels),
        }
    }

    /// Capture time relative to the device clock
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn lock_for_reading(&self) -> RwLockReadGuard<'_, PixelBuffer> {
        // A panicking writer cannot leave a PixelBuffer half-assigned
        self.pixels.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_for_writing(&self) -> RwLockWriteGuard<'_, PixelBuffer> {
        self.pixels.write().unwrap_or_else(PoisonError::into_inner)
    }
}
