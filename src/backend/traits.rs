use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::confirmation::ConfirmationResponder;
use crate::engine::session::{InstallSession, SessionId, SessionStatus};
use crate::error::ErrorCode;

/// Session status as reported by the backend. Richer than [`SessionStatus`]:
/// it also carries the transient `Downloaded` and `Canceling` phases.
///
/// [`SessionStatus`]: crate::engine::session::SessionStatus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendStatus {
    Pending,
    Downloading,
    Downloaded,
    Installing,
    Installed,
    Failed,
    Canceled,
    RequiresUserConfirmation,
    Canceling,
}

impl BackendStatus {
    pub fn from_raw(code: i32) -> Option<Self> {
        let status = match code {
            1 => Self::Pending,
            2 => Self::Downloading,
            3 => Self::Downloaded,
            4 => Self::Installing,
            5 => Self::Installed,
            6 => Self::Failed,
            7 => Self::Canceled,
            8 => Self::RequiresUserConfirmation,
            9 => Self::Canceling,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Installed | Self::Failed | Self::Canceled)
    }
}

/// One state update pushed by the backend for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub status: BackendStatus,
    pub error_code: Option<ErrorCode>,
    pub bytes_downloaded: Option<u64>,
    pub total_bytes: Option<u64>,
}

impl SessionState {
    pub fn new(session_id: SessionId, status: BackendStatus) -> Self {
        Self {
            session_id,
            status,
            error_code: None,
            bytes_downloaded: None,
            total_bytes: None,
        }
    }

    pub fn progress(session_id: SessionId, bytes_downloaded: u64, total_bytes: u64) -> Self {
        Self {
            bytes_downloaded: Some(bytes_downloaded),
            total_bytes: Some(total_bytes),
            ..Self::new(session_id, BackendStatus::Downloading)
        }
    }

    pub fn failed(session_id: SessionId, code: ErrorCode) -> Self {
        Self {
            error_code: Some(code),
            ..Self::new(session_id, BackendStatus::Failed)
        }
    }

    pub fn is_service_died(&self) -> bool {
        self.status == BackendStatus::Failed && self.error_code == Some(ErrorCode::ServiceDied)
    }
}

/// The event that would bring a tracker up to the state the backend reports
/// for `session`.
impl From<&InstallSession> for SessionState {
    fn from(session: &InstallSession) -> Self {
        let session_id = session.session_id;
        match session.status {
            SessionStatus::Pending => Self::new(session_id, BackendStatus::Pending),
            SessionStatus::Downloading => {
                Self::progress(session_id, session.bytes_downloaded, session.total_bytes)
            }
            SessionStatus::RequiresConfirmation => {
                Self::new(session_id, BackendStatus::RequiresUserConfirmation)
            }
            SessionStatus::Installing => Self::new(session_id, BackendStatus::Installing),
            SessionStatus::Installed => Self::new(session_id, BackendStatus::Installed),
            SessionStatus::Failed => Self::failed(
                session_id,
                session.error_code.unwrap_or(ErrorCode::InternalError),
            ),
            SessionStatus::Canceled => Self::new(session_id, BackendStatus::Canceled),
        }
    }
}

#[async_trait]
pub trait InstallBackend: Send + Sync {
    /// Submit an install request; resolves to the new session id.
    async fn start_install(&self, module_name: &str) -> Result<SessionId, ErrorCode>;

    async fn cancel_install(&self, session_id: SessionId) -> Result<(), ErrorCode>;

    /// Sessions the backend currently considers in flight, across all callers.
    async fn list_active_sessions(&self) -> Result<Vec<InstallSession>, ErrorCode>;

    /// Open a new receiver on the backend's state event stream.
    fn subscribe(&self) -> broadcast::Receiver<SessionState>;

    fn installed_modules(&self) -> HashSet<String>;

    /// Hand the user-consent flow for `session` to the platform. The responder
    /// must be completed at most once with the user's answer.
    fn present_confirmation(
        &self,
        session: &InstallSession,
        responder: ConfirmationResponder,
    ) -> Result<(), ErrorCode>;
}
