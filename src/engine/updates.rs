// Install notifications: what subscribers see as sessions move.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::policy::ConflictReport;
use super::session::{InstallSession, SessionId};
use crate::error::ErrorCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallUpdate {
    Submitted(InstallSession),
    Progress(InstallSession),
    ConfirmationRequired(InstallSession),
    Installing(InstallSession),
    Installed(InstallSession),
    Failed {
        session: InstallSession,
        error: ErrorCode,
    },
    Canceled(InstallSession),
    /// A ServiceDied session was resubmitted as `session`.
    Resubmitted {
        previous: SessionId,
        session: InstallSession,
    },
    ConflictsResolved(ConflictReport),
}

impl InstallUpdate {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::Submitted(s)
            | Self::Progress(s)
            | Self::ConfirmationRequired(s)
            | Self::Installing(s)
            | Self::Installed(s)
            | Self::Canceled(s) => Some(s.session_id),
            Self::Failed { session, .. } | Self::Resubmitted { session, .. } => {
                Some(session.session_id)
            }
            Self::ConflictsResolved(_) => None,
        }
    }
}

/// Cancels a [`Subscription`] from anywhere, e.g. when the UI goes away.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<InstallUpdate>,
    token: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<InstallUpdate>, token: CancellationToken) -> Self {
        Self { rx, token }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            token: self.token.clone(),
        }
    }

    /// Next update, or `None` once unsubscribed or the manager is gone.
    /// A subscriber that falls behind skips the missed updates.
    pub async fn recv(&mut self) -> Option<InstallUpdate> {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                received = self.rx.recv() => match received {
                    Ok(update) => return Some(update),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("install subscriber lagged, skipped {} updates", missed);
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    pub fn unsubscribe(self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsubscribe_through_handle() {
        let (tx, rx) = broadcast::channel(4);
        let mut subscription = Subscription::new(rx, CancellationToken::new());
        let handle = subscription.handle();

        tx.send(InstallUpdate::Submitted(InstallSession::new(1, "maps")))
            .unwrap();
        assert_eq!(subscription.recv().await.unwrap().session_id(), Some(1));

        handle.unsubscribe();
        assert!(!handle.is_active());
        assert_eq!(subscription.recv().await, None);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let (tx, rx) = broadcast::channel(2);
        let mut subscription = Subscription::new(rx, CancellationToken::new());
        for id in 1..=4 {
            tx.send(InstallUpdate::Submitted(InstallSession::new(id, "maps")))
                .unwrap();
        }
        assert_eq!(subscription.recv().await.unwrap().session_id(), Some(3));
        assert_eq!(subscription.recv().await.unwrap().session_id(), Some(4));
    }

    #[tokio::test]
    async fn test_closed_channel_ends_stream() {
        let (tx, rx) = broadcast::channel::<InstallUpdate>(2);
        let mut subscription = Subscription::new(rx, CancellationToken::new());
        drop(tx);
        assert_eq!(subscription.recv().await, None);
    }
}
