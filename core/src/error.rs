//! Core error types

use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Pidfile error: {0}")]
    PidfileError(String),

    #[error("Another instance is already running with pid {pid}, as seen in pidfile \"{pidfile}\"")]
    AlreadyRunning { pid: i32, pidfile: String },

    #[error("Lost ownership of pidfile \"{0}\"")]
    FencingLost(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("Failed to wait for process: {0}")]
    ProcessWait(String),

    #[error("Failed to signal process: {0}")]
    ProcessSignal(String),

    #[error("State store error: {0}")]
    StateError(String),

    #[error("Monitor error: {0}")]
    MonitorError(String),

    #[error("Transition error: {0}")]
    TransitionError(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;
