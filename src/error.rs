// Install error taxonomy: backend codes and the typed errors built on them.

use serde::Serialize;
use thiserror::Error;

use crate::engine::session::SessionId;

pub const RAW_ACTIVE_SESSIONS_LIMIT_EXCEEDED: i32 = -1;
pub const RAW_NETWORK_ERROR: i32 = -6;
pub const RAW_SERVICE_DIED: i32 = -9;
pub const RAW_INTERNAL_ERROR: i32 = -100;

/// Error code reported by the install backend, either at submission time or
/// on a FAILED state event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
pub enum ErrorCode {
    #[error("network error")]
    NetworkError,
    #[error("active sessions limit exceeded")]
    ActiveSessionsLimitExceeded,
    #[error("internal backend error")]
    InternalError,
    #[error("install service died")]
    ServiceDied,
    #[error("unknown backend error {0}")]
    Unknown(i32),
}

impl ErrorCode {
    pub fn from_raw(code: i32) -> Self {
        match code {
            RAW_NETWORK_ERROR => Self::NetworkError,
            RAW_ACTIVE_SESSIONS_LIMIT_EXCEEDED => Self::ActiveSessionsLimitExceeded,
            RAW_INTERNAL_ERROR => Self::InternalError,
            RAW_SERVICE_DIED => Self::ServiceDied,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(&self) -> i32 {
        match self {
            Self::NetworkError => RAW_NETWORK_ERROR,
            Self::ActiveSessionsLimitExceeded => RAW_ACTIVE_SESSIONS_LIMIT_EXCEEDED,
            Self::InternalError => RAW_INTERNAL_ERROR,
            Self::ServiceDied => RAW_SERVICE_DIED,
            Self::Unknown(code) => *code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("module name must not be empty")]
    EmptyModuleName,
    #[error("network unavailable, retry once connectivity is restored")]
    Network,
    #[error("too many active install sessions")]
    ActiveSessionsLimitExceeded,
    #[error("install backend internal error")]
    Internal,
    #[error("install backend rejected the request with code {0}")]
    Unknown(i32),
}

impl From<ErrorCode> for SubmissionError {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NetworkError => Self::Network,
            ErrorCode::ActiveSessionsLimitExceeded => Self::ActiveSessionsLimitExceeded,
            ErrorCode::InternalError => Self::Internal,
            // ServiceDied is only meaningful as a state event.
            ErrorCode::ServiceDied => Self::Unknown(RAW_SERVICE_DIED),
            ErrorCode::Unknown(raw) => Self::Unknown(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("session {0} is not known to this manager")]
    UnknownSession(SessionId),
    #[error("session {0} already reached a terminal state")]
    AlreadyTerminal(SessionId),
    #[error("backend refused to cancel: {0}")]
    Backend(ErrorCode),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfirmationError {
    #[error("a confirmation is already pending for session {0}")]
    AlreadyPending(SessionId),
    #[error("session {0} is not awaiting confirmation")]
    NotAwaitingConfirmation(SessionId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_codes_are_preserved() {
        for code in [-1, -6, -9, -100, -2, -14, 42] {
            assert_eq!(ErrorCode::from_raw(code).raw(), code);
        }
        assert_eq!(ErrorCode::from_raw(-2), ErrorCode::Unknown(-2));
        assert_eq!(ErrorCode::from_raw(-9), ErrorCode::ServiceDied);
    }

    #[test]
    fn test_submission_error_mapping() {
        assert_eq!(
            SubmissionError::from(ErrorCode::NetworkError),
            SubmissionError::Network
        );
        assert_eq!(
            SubmissionError::from(ErrorCode::ActiveSessionsLimitExceeded),
            SubmissionError::ActiveSessionsLimitExceeded
        );
        assert_eq!(
            SubmissionError::from(ErrorCode::Unknown(-2)),
            SubmissionError::Unknown(-2)
        );
    }
}
