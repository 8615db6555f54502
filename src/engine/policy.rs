// Conflict policy: what to do with existing sessions when the backend refuses
// a new request because too many are already active.

use serde::Serialize;

use super::session::{InstallSession, SessionId, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    Cancel,
    Defer,
}

pub trait ConflictPolicy: Send + Sync {
    fn decide(&self, session: &InstallSession) -> ConflictDecision;
}

/// Cancels sessions that are actively downloading and leaves the rest alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct CancelDownloading;

impl ConflictPolicy for CancelDownloading {
    fn decide(&self, session: &InstallSession) -> ConflictDecision {
        match session.status {
            SessionStatus::Downloading => ConflictDecision::Cancel,
            _ => ConflictDecision::Defer,
        }
    }
}

/// Never cancels anything; the caller waits for sessions to finish.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferAll;

impl ConflictPolicy for DeferAll {
    fn decide(&self, _session: &InstallSession) -> ConflictDecision {
        ConflictDecision::Defer
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub canceled: Vec<SessionId>,
    pub deferred: Vec<SessionId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_downloading_policy() {
        let mut session = InstallSession::new(1, "maps");
        assert_eq!(CancelDownloading.decide(&session), ConflictDecision::Defer);

        session.status = SessionStatus::Downloading;
        assert_eq!(CancelDownloading.decide(&session), ConflictDecision::Cancel);
        assert_eq!(DeferAll.decide(&session), ConflictDecision::Defer);

        session.status = SessionStatus::Installing;
        assert_eq!(CancelDownloading.decide(&session), ConflictDecision::Defer);
    }
}
