// Confirmation gate: suspends a session until the user answers a consent prompt.

use std::collections::HashSet;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::session::{InstallSession, SessionId, SessionStatus};
use crate::error::ConfirmationError;

/// Result code for a confirmed prompt.
pub const RESULT_OK: i32 = -1;
/// Result code for a dismissed or declined prompt.
pub const RESULT_CANCELED: i32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationResult {
    pub code: i32,
    pub payload: Option<Bytes>,
}

impl ConfirmationResult {
    pub fn accepted() -> Self {
        Self {
            code: RESULT_OK,
            payload: None,
        }
    }

    pub fn declined() -> Self {
        Self {
            code: RESULT_CANCELED,
            payload: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.code == RESULT_OK
    }
}

/// One-shot completion handle given to whoever presents the prompt.
#[derive(Debug)]
pub struct ConfirmationResponder {
    session_id: SessionId,
    tx: oneshot::Sender<ConfirmationResult>,
}

impl ConfirmationResponder {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Deliver the user's answer. Returns `false` if nobody is waiting anymore.
    pub fn complete(self, result: ConfirmationResult) -> bool {
        self.tx.send(result).is_ok()
    }
}

#[derive(Default)]
pub struct ConfirmationGate {
    pending: Mutex<HashSet<SessionId>>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a confirmation request for a session that is waiting on the user.
    /// Only one request per session may be outstanding.
    pub fn request_confirmation(
        &self,
        session: &InstallSession,
    ) -> Result<(ConfirmationResponder, oneshot::Receiver<ConfirmationResult>), ConfirmationError>
    {
        if session.status != SessionStatus::RequiresConfirmation {
            return Err(ConfirmationError::NotAwaitingConfirmation(session.session_id));
        }
        if !self.pending.lock().insert(session.session_id) {
            return Err(ConfirmationError::AlreadyPending(session.session_id));
        }

        debug!("confirmation opened for session {}", session.session_id);
        let (tx, rx) = oneshot::channel();
        let responder = ConfirmationResponder {
            session_id: session.session_id,
            tx,
        };
        Ok((responder, rx))
    }

    /// Close the outstanding request for a session, if any.
    pub fn release(&self, session_id: SessionId) -> bool {
        self.pending.lock().remove(&session_id)
    }

    pub fn is_pending(&self, session_id: SessionId) -> bool {
        self.pending.lock().contains(&session_id)
    }
}
