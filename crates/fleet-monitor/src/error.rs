use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("entity source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("no entities loaded")]
    NoEntities,
    #[error("a run is already active")]
    AlreadyRunning,
    #[error("remote request failed: {0}")]
    RemoteRequestFailed(String),
    #[error("monitor is shut down")]
    Closed,
}

pub type MonitorResult<T> = Result<T, MonitorError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("invalid entity data: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("engine rejected {command}: {message}")]
    Rejected {
        command: &'static str,
        message: String,
    },
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

impl From<SourceError> for MonitorError {
    fn from(err: SourceError) -> Self {
        MonitorError::SourceUnavailable(err.to_string())
    }
}

impl From<RemoteError> for MonitorError {
    fn from(err: RemoteError) -> Self {
        MonitorError::RemoteRequestFailed(err.to_string())
    }
}
