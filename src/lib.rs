pub mod capture;
pub mod error;
pub mod grabber;
pub mod pipeline;
pub mod recorder;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use capture::device::{TriggerMode, TriggerSignalType};
use capture::synthetic::Pattern;

pub use capture::{BlockingCapture, Frame, PixelBuffer, PixelFormat, SyntheticDevice};
pub use error::{Error, Result};
pub use grabber::{DeviceState, FrameSink, Grabber, GrabberHandle, GrabberStats};
pub use recorder::{Recorder, RecorderState, RecordingArchive};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variable prefix, e.g. `FRAMEGRAB__SYNTHETIC__FPS=60`
const ENV_PREFIX: &str = "FRAMEGRAB";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub grabber: GrabberConfig,
    pub synthetic: SyntheticConfig,
    pub consumer: ConsumerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrabberConfig {
    pub device_id: u32,
    pub trigger_mode: TriggerMode,
    pub trigger_signal: TriggerSignalType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pattern: Pattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Consumer cycles per second
    pub tick_hz: u32,
    /// How long the demo records before reporting
    pub record_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive
    pub filter: String,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            pattern: Pattern::Gradient,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            tick_hz: 60,
            record_seconds: 3,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "framegrab=info".into(),
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}
