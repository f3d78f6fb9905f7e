use std::io;
use std::str::Utf8Error;
use thiserror::Error;

use crate::device::types::{AttributeId, DeviceId};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (bluetooth): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to start application (runtime): {source}")]
    Runtime { #[from] source: io::Error },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapters are available")]
    NoAdapters,

    #[error("Device {0} is not known to the bluetooth adapter")]
    UnknownDevice(DeviceId),

    #[error("Attribute {0} is not known for this connection")]
    UnknownAttribute(AttributeId),

    #[error("Bluetooth adapter error: {message}")]
    Platform { message: String },
}

/// A battery level byte that must not be stored as a reading.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingError {
    #[error("Battery level {raw} is out of range (expected 0-100 or 255)")]
    OutOfRange { raw: u8 },
}
