pub mod device;
pub mod frame;
pub mod rate;
pub mod synthetic;

pub use device::BlockingCapture;
pub use frame::{Frame, PixelBuffer, PixelFormat};
pub use synthetic::SyntheticDevice;
