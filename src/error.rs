//! Error taxonomy for the acquisition pipeline

use thiserror::Error;

use crate::capture::device::{Feature, TriggerMode, TriggerSignalType};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open device {device_id}: {reason}")]
    DeviceOpenFailure { device_id: u32, reason: String },

    #[error("device is not open")]
    NotOpen,

    #[error("device does not support {0:?}")]
    UnsupportedFeature(Feature),

    #[error("device does not support trigger mode {0:?}")]
    UnsupportedTriggerMode(TriggerMode),

    #[error("device does not support trigger signal {0:?}")]
    UnsupportedSignalType(TriggerSignalType),

    /// An operation was requested from a state that does not allow it
    #[error("cannot {action} while {state}")]
    InvalidStateTransition {
        state: &'static str,
        action: &'static str,
    },

    #[error("driver error: {0}")]
    Driver(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
