//! Error kinds surfaced by the writer session.

use filewriter_protocol::{
    ErrorInfo, ERROR_ALREADY_RUNNING, ERROR_FINALIZATION, ERROR_INVALID_PATH,
    ERROR_JOB_MISMATCH, ERROR_MALFORMED_MESSAGE, ERROR_NOT_RUNNING,
    ERROR_SESSION_CLOSED,
};

use crate::session::SessionState;

/// All errors a [`crate::session::WriterSession`] can report.
///
/// `InvalidPath` and `Finalization` end the session; the rest leave the
/// session state untouched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WriterError {
    #[error("Cannot write output file {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("A writer session is already {state}")]
    AlreadyRunning { state: SessionState },

    #[error("No file is being written (session is {state})")]
    NotRunning { state: SessionState },

    #[error("Writer session is closed")]
    SessionClosed,

    #[error("Failed to finalize output file {path}: {details}")]
    Finalization { path: String, details: String },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Stop targets job {requested} but the running job is {running}")]
    JobMismatch { requested: String, running: String },
}

impl WriterError {
    pub fn code(&self) -> &'static str {
        match self {
            WriterError::InvalidPath { .. } => ERROR_INVALID_PATH,
            WriterError::AlreadyRunning { .. } => ERROR_ALREADY_RUNNING,
            WriterError::NotRunning { .. } => ERROR_NOT_RUNNING,
            WriterError::SessionClosed => ERROR_SESSION_CLOSED,
            WriterError::Finalization { .. } => ERROR_FINALIZATION,
            WriterError::MalformedMessage(_) => ERROR_MALFORMED_MESSAGE,
            WriterError::JobMismatch { .. } => ERROR_JOB_MISMATCH,
        }
    }

    /// Errors after which the session can no longer write.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WriterError::InvalidPath { .. }
                | WriterError::Finalization { .. }
                | WriterError::SessionClosed
        )
    }
}

impl From<WriterError> for ErrorInfo {
    fn from(err: WriterError) -> Self {
        ErrorInfo::new(err.code(), err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WriterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_wire_codes() {
        let info: ErrorInfo = WriterError::AlreadyRunning {
            state: SessionState::Running,
        }
        .into();
        assert_eq!(info.code, "already_running");
        assert_eq!(info.message, "A writer session is already running");

        let info: ErrorInfo = WriterError::SessionClosed.into();
        assert_eq!(info.code, "session_closed");
    }

    #[test]
    fn only_path_and_finalization_failures_are_terminal() {
        assert!(WriterError::Finalization {
            path: "/x".to_string(),
            details: "disk full".to_string(),
        }
        .is_terminal());
        assert!(!WriterError::NotRunning {
            state: SessionState::Idle
        }
        .is_terminal());
        assert!(!WriterError::MalformedMessage("bad".to_string()).is_terminal());
    }
}
