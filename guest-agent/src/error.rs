use std::io;
use std::time::Duration;

use guestctl_protocol::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no free pid near {requested}")]
    PidExhausted { requested: u32 },

    #[error("supervisor for pid {pid} is already registered")]
    AlreadyRegistered { pid: u32 },
}

/// Why an `ExecStart` did not produce a running supervisor.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("process limit of {limit} reached")]
    AdmissionDenied { limit: u32 },

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start supervisor thread: {0}")]
    Worker(#[source] io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl StartError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StartError::AdmissionDenied { .. } => ErrorCode::AdmissionDenied,
            StartError::Spawn { .. } => ErrorCode::SpawnFailed,
            StartError::Worker(_) | StartError::Registry(_) => ErrorCode::Internal,
        }
    }
}

/// Why a request never reached (or never came back from) a supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("process is no longer running")]
    NotRunning,

    #[error("request queue is full")]
    Busy,

    #[error("no completion within {0:?}")]
    Timeout(Duration),
}

impl SubmitError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SubmitError::NotRunning => ErrorCode::NotFound,
            SubmitError::Busy => ErrorCode::Internal,
            SubmitError::Timeout(_) => ErrorCode::Timeout,
        }
    }
}
