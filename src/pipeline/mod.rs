pub mod swap;

pub use swap::{SwapBuffer, SwapStats};
