// Install session state machine: one tracked request for one feature module.

use serde::Serialize;

use crate::backend::traits::{BackendStatus, SessionState};
use crate::error::ErrorCode;

/// Opaque session handle assigned by the install backend.
pub type SessionId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Downloading,
    RequiresConfirmation,
    Installing,
    Installed,
    Failed,
    Canceled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Installed | Self::Failed | Self::Canceled)
    }
}

/// What an accepted event did to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Progress,
    ConfirmationRequired,
    Installing,
    Installed,
    Failed(ErrorCode),
    Canceled,
}

impl Transition {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Installed | Self::Failed(_) | Self::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallSession {
    pub session_id: SessionId,
    pub module_name: String,
    pub status: SessionStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub error_code: Option<ErrorCode>,
    /// Session this one was resubmitted for after the service died.
    pub retry_of: Option<SessionId>,
    /// Resubmission count of the logical request, 0 for the original.
    pub attempt: u32,
}

impl InstallSession {
    pub fn new(session_id: SessionId, module_name: impl Into<String>) -> Self {
        Self {
            session_id,
            module_name: module_name.into(),
            status: SessionStatus::Pending,
            bytes_downloaded: 0,
            total_bytes: 0,
            error_code: None,
            retry_of: None,
            attempt: 0,
        }
    }

    pub fn resubmitted(session_id: SessionId, previous: &InstallSession) -> Self {
        Self {
            retry_of: Some(previous.session_id),
            attempt: previous.attempt + 1,
            ..Self::new(session_id, previous.module_name.clone())
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Download progress in percent, only meaningful while downloading.
    pub fn progress_percent(&self) -> Option<u8> {
        if self.status != SessionStatus::Downloading || self.total_bytes == 0 {
            return None;
        }
        let done = self.bytes_downloaded.min(self.total_bytes);
        Some((done.saturating_mul(100) / self.total_bytes) as u8)
    }

    /// Apply a backend state event. Returns `None` when the event does not
    /// move the session (stale, backwards, or informational).
    pub fn apply(&mut self, state: &SessionState) -> Option<Transition> {
        if self.status.is_terminal() {
            return None;
        }

        use SessionStatus::*;
        match state.status {
            BackendStatus::Pending | BackendStatus::Canceling => None,
            BackendStatus::Downloading | BackendStatus::Downloaded => {
                if !matches!(self.status, Pending | Downloading | RequiresConfirmation) {
                    return None;
                }
                self.status = Downloading;
                self.record_progress(state);
                if state.status == BackendStatus::Downloaded {
                    self.bytes_downloaded = self.bytes_downloaded.max(self.total_bytes);
                }
                Some(Transition::Progress)
            }
            BackendStatus::RequiresUserConfirmation => {
                if !matches!(self.status, Pending | Downloading | RequiresConfirmation) {
                    return None;
                }
                self.status = RequiresConfirmation;
                self.record_progress(state);
                Some(Transition::ConfirmationRequired)
            }
            BackendStatus::Installing => {
                if self.status == Installing {
                    return None;
                }
                self.status = Installing;
                Some(Transition::Installing)
            }
            BackendStatus::Installed => {
                self.status = Installed;
                self.bytes_downloaded = self.bytes_downloaded.max(self.total_bytes);
                Some(Transition::Installed)
            }
            BackendStatus::Failed => {
                let code = state.error_code.unwrap_or(ErrorCode::Unknown(0));
                if code == ErrorCode::ServiceDied {
                    return None;
                }
                Some(self.fail(code))
            }
            BackendStatus::Canceled => {
                self.status = Canceled;
                Some(Transition::Canceled)
            }
        }
    }

    /// Resume or cancel after the user answered a confirmation prompt.
    pub fn resolve_confirmation(&mut self, accepted: bool) -> Option<Transition> {
        if self.status != SessionStatus::RequiresConfirmation {
            return None;
        }
        if accepted {
            self.status = SessionStatus::Downloading;
            Some(Transition::Progress)
        } else {
            self.status = SessionStatus::Canceled;
            Some(Transition::Canceled)
        }
    }

    pub fn fail(&mut self, code: ErrorCode) -> Transition {
        self.status = SessionStatus::Failed;
        self.error_code = Some(code);
        Transition::Failed(code)
    }

    fn record_progress(&mut self, state: &SessionState) {
        if let Some(total) = state.total_bytes {
            self.total_bytes = self.total_bytes.max(total);
        }
        if let Some(bytes) = state.bytes_downloaded {
            self.bytes_downloaded = self.bytes_downloaded.max(bytes);
        }
    }
}
