//! Error types for kflash-core

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::process::ProcessError;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Filesystem error with the path that caused it
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Registry file could not be parsed
    #[error("Failed to parse registry '{}': {source}", path.display())]
    RegistryParse {
        /// Registry file
        path: PathBuf,
        /// Parser error
        #[source]
        source: toml::de::Error,
    },

    /// Registry could not be serialized
    #[error("Failed to serialize registry: {0}")]
    RegistrySerialize(#[from] toml::ser::Error),

    /// Device key is not present in the registry
    #[error("Device '{0}' is not registered")]
    UnknownDevice(String),

    /// Cached build configuration has no CONFIG_MCU line
    #[error("Cached config '{}' has no CONFIG_MCU entry", path.display())]
    MissingMcu {
        /// Config file
        path: PathBuf,
    },

    /// Subprocess could not be run
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl Error {
    /// Wrap an I/O error together with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure to stop or start the firmware service
#[derive(Debug, Clone, Error)]
#[error("Failed to {action} service '{service}': {detail}")]
pub struct ServiceError {
    /// "stop" or "start"
    pub action: &'static str,
    /// Service unit name
    pub service: String,
    /// Tool output or spawn error
    pub detail: String,
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
