// Active session registry: the single owner of per-session state.
//
// Every mutation happens under one lock so that a submission registering a new
// id can never race an event-driven retirement of another.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use super::session::{InstallSession, SessionId, Transition};
use crate::backend::traits::SessionState;
use crate::config::RetryPolicy;
use crate::error::ErrorCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The session moved. `superseded` lists older sessions of the same
    /// lineage retired together with it.
    Applied {
        session: InstallSession,
        transition: Transition,
        superseded: Vec<SessionId>,
    },
    /// Known session, but the event did not change it.
    Ignored,
    /// A replaced session ended on its own; its request lives on under
    /// `replacement`, so nothing is reported for it.
    Retired {
        session_id: SessionId,
        replacement: SessionId,
    },
    /// Unknown id held back until an in-flight submission registers it.
    Buffered,
    /// Unknown or already retired id.
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Issue(InstallSession),
    InFlight,
    Superseded(SessionId),
    /// The retry budget is spent; the session was failed and retired.
    Exhausted(InstallSession),
    NotActive,
}

struct TrackedSession {
    session: InstallSession,
    retry_in_flight: bool,
    superseded_by: Option<SessionId>,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<SessionId, TrackedSession>,
    retired: HashSet<SessionId>,
    /// Resubmitted session -> the session it replaced.
    parents: HashMap<SessionId, SessionId>,
    submissions_in_flight: usize,
    early: HashMap<SessionId, Vec<SessionState>>,
}

impl RegistryState {
    fn transition(
        &mut self,
        session_id: SessionId,
        step: impl FnOnce(&mut InstallSession) -> Option<Transition>,
    ) -> ApplyOutcome {
        let Some(tracked) = self.active.get_mut(&session_id) else {
            return ApplyOutcome::Dropped;
        };
        let mut next = tracked.session.clone();
        let Some(transition) = step(&mut next) else {
            return ApplyOutcome::Ignored;
        };

        if let Some(replacement) = tracked.superseded_by {
            if !transition.is_terminal() {
                return ApplyOutcome::Ignored;
            }
            self.active.remove(&session_id);
            self.retired.insert(session_id);
            for other in self.active.values_mut() {
                if other.superseded_by == Some(session_id) {
                    other.superseded_by = Some(replacement);
                }
            }
            debug!(
                "replaced session {} ended, request continues as {}",
                session_id, replacement
            );
            return ApplyOutcome::Retired {
                session_id,
                replacement,
            };
        }

        tracked.session = next;
        let session = tracked.session.clone();

        let mut superseded = Vec::new();
        if transition.is_terminal() {
            self.active.remove(&session_id);
            self.retired.insert(session_id);

            let mut ancestor = self.parents.remove(&session_id);
            while let Some(id) = ancestor {
                ancestor = self.parents.remove(&id);
                self.active.remove(&id);
                if self.retired.insert(id) {
                    superseded.push(id);
                }
            }
        }

        ApplyOutcome::Applied {
            session,
            transition,
            superseded,
        }
    }

    fn apply(&mut self, event: &SessionState, early_capacity: usize) -> ApplyOutcome {
        let session_id = event.session_id;
        if self.active.contains_key(&session_id) {
            return self.transition(session_id, |session| session.apply(event));
        }
        if self.retired.contains(&session_id) || self.submissions_in_flight == 0 {
            return ApplyOutcome::Dropped;
        }

        let held = self.early.entry(session_id).or_default();
        if held.len() >= early_capacity {
            return ApplyOutcome::Dropped;
        }
        held.push(event.clone());
        ApplyOutcome::Buffered
    }
}

pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    early_capacity: usize,
}

impl SessionRegistry {
    pub fn new(early_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            early_capacity,
        }
    }

    /// Mark a submission as in flight. Events for unknown ids are buffered
    /// until every outstanding ticket is dropped.
    pub fn begin_submission(&self) -> SubmissionTicket<'_> {
        self.state.lock().submissions_in_flight += 1;
        SubmissionTicket { registry: self }
    }

    /// Route a backend event to its session.
    pub fn apply(&self, event: &SessionState) -> ApplyOutcome {
        self.state.lock().apply(event, self.early_capacity)
    }

    pub fn resolve_confirmation(&self, session_id: SessionId, accepted: bool) -> ApplyOutcome {
        self.state
            .lock()
            .transition(session_id, |session| session.resolve_confirmation(accepted))
    }

    /// Decide whether a ServiceDied event for `session_id` should trigger a
    /// resubmission, and reserve it if so.
    pub fn begin_retry(&self, session_id: SessionId, policy: &RetryPolicy) -> RetryDecision {
        let mut state = self.state.lock();
        let Some(tracked) = state.active.get_mut(&session_id) else {
            return RetryDecision::NotActive;
        };
        if let Some(next) = tracked.superseded_by {
            return RetryDecision::Superseded(next);
        }
        if tracked.retry_in_flight {
            return RetryDecision::InFlight;
        }
        if !policy.allows(tracked.session.attempt + 1) {
            return match state.transition(session_id, |s| Some(s.fail(ErrorCode::ServiceDied))) {
                ApplyOutcome::Applied { session, .. } => RetryDecision::Exhausted(session),
                _ => RetryDecision::NotActive,
            };
        }
        tracked.retry_in_flight = true;
        RetryDecision::Issue(tracked.session.clone())
    }

    /// Release a retry reservation; `replacement` is the session that now
    /// carries the request, if the resubmission went through. Returns false
    /// when `session_id` ended while the resubmission was in flight.
    pub fn finish_retry(&self, session_id: SessionId, replacement: Option<SessionId>) -> bool {
        let mut state = self.state.lock();
        let Some(tracked) = state.active.get_mut(&session_id) else {
            return false;
        };
        tracked.retry_in_flight = false;
        if replacement.is_some() {
            tracked.superseded_by = replacement;
        }
        true
    }

    /// The session currently carrying the request `session_id` was issued
    /// for: `session_id` itself, or the newest resubmission replacing it.
    pub fn live_session(&self, session_id: SessionId) -> Option<SessionId> {
        let state = self.state.lock();
        let mut current = session_id;
        loop {
            match state.active.get(&current)?.superseded_by {
                Some(next) => current = next,
                None => return Some(current),
            }
        }
    }

    pub fn is_superseded(&self, session_id: SessionId) -> bool {
        self.state
            .lock()
            .active
            .get(&session_id)
            .is_some_and(|tracked| tracked.superseded_by.is_some())
    }

    /// Sessions whose state can be checked against the backend: live, and
    /// not waiting on a resubmission.
    pub fn resync_candidates(&self) -> Vec<InstallSession> {
        let state = self.state.lock();
        let mut sessions: Vec<InstallSession> = state
            .active
            .values()
            .filter(|tracked| tracked.superseded_by.is_none() && !tracked.retry_in_flight)
            .map(|tracked| tracked.session.clone())
            .collect();
        sessions.sort_by_key(|session| session.session_id);
        sessions
    }

    pub fn get(&self, session_id: SessionId) -> Option<InstallSession> {
        self.state
            .lock()
            .active
            .get(&session_id)
            .map(|tracked| tracked.session.clone())
    }

    pub fn is_retired(&self, session_id: SessionId) -> bool {
        self.state.lock().retired.contains(&session_id)
    }

    /// Snapshot of all non-terminal sessions, ordered by id.
    pub fn list_active(&self) -> Vec<InstallSession> {
        let state = self.state.lock();
        let mut sessions: Vec<InstallSession> = state
            .active
            .values()
            .map(|tracked| tracked.session.clone())
            .collect();
        sessions.sort_by_key(|session| session.session_id);
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }
}

/// Guard for one in-flight submission.
pub struct SubmissionTicket<'a> {
    registry: &'a SessionRegistry,
}

impl SubmissionTicket<'_> {
    /// Start tracking a freshly submitted session and replay any events that
    /// arrived for it before the submission completed.
    pub fn register(&self, session: InstallSession) -> Vec<ApplyOutcome> {
        let mut state = self.registry.state.lock();
        let session_id = session.session_id;
        state.retired.remove(&session_id);
        if let Some(parent) = session.retry_of {
            state.parents.insert(session_id, parent);
        }
        state.active.insert(
            session_id,
            TrackedSession {
                session,
                retry_in_flight: false,
                superseded_by: None,
            },
        );

        let held = state.early.remove(&session_id).unwrap_or_default();
        if !held.is_empty() {
            debug!("replaying {} early events for session {}", held.len(), session_id);
        }
        held.iter()
            .map(|event| state.transition(session_id, |s| s.apply(event)))
            .collect()
    }
}

impl Drop for SubmissionTicket<'_> {
    fn drop(&mut self) {
        let mut state = self.registry.state.lock();
        state.submissions_in_flight = state.submissions_in_flight.saturating_sub(1);
        if state.submissions_in_flight == 0 && !state.early.is_empty() {
            debug!("discarding early events for {} unclaimed sessions", state.early.len());
            state.early.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::traits::BackendStatus;
    use crate::engine::session::SessionStatus;

    fn registry_with(sessions: &[(SessionId, &str)]) -> SessionRegistry {
        let registry = SessionRegistry::new(4);
        {
            let ticket = registry.begin_submission();
            for (id, module) in sessions {
                ticket.register(InstallSession::new(*id, *module));
            }
        }
        registry
    }

    #[test]
    fn test_unknown_ids_are_dropped() {
        let registry = registry_with(&[(1, "maps")]);
        assert_eq!(registry.apply(&SessionState::progress(2, 10, 100)), ApplyOutcome::Dropped);
        assert_eq!(registry.get(1).unwrap().bytes_downloaded, 0);
        assert!(registry.get(2).is_none());
    }

    #[test]
    fn test_terminal_event_retires_session() {
        let registry = registry_with(&[(1, "maps"), (2, "camera")]);
        registry.apply(&SessionState::progress(1, 10, 100));

        let outcome = registry.apply(&SessionState::new(1, BackendStatus::Installed));
        assert!(matches!(
            outcome,
            ApplyOutcome::Applied {
                transition: Transition::Installed,
                ..
            }
        ));
        assert!(registry.is_retired(1));
        let active: Vec<SessionId> = registry.list_active().iter().map(|s| s.session_id).collect();
        assert_eq!(active, vec![2]);

        // No resurrection through late events.
        assert_eq!(registry.apply(&SessionState::progress(1, 20, 100)), ApplyOutcome::Dropped);
        assert!(registry.get(1).is_none());
    }

    #[test]
    fn test_early_events_replay_on_register() {
        let registry = SessionRegistry::new(4);
        let ticket = registry.begin_submission();

        assert_eq!(registry.apply(&SessionState::progress(9, 50, 100)), ApplyOutcome::Buffered);

        let replayed = ticket.register(InstallSession::new(9, "maps"));
        assert_eq!(replayed.len(), 1);
        let session = registry.get(9).unwrap();
        assert_eq!(session.status, SessionStatus::Downloading);
        assert_eq!(session.bytes_downloaded, 50);
    }

    #[test]
    fn test_early_events_discarded_without_submission() {
        let registry = SessionRegistry::new(2);
        {
            let _ticket = registry.begin_submission();
            registry.apply(&SessionState::progress(5, 1, 10));
            registry.apply(&SessionState::progress(5, 2, 10));
            assert_eq!(registry.apply(&SessionState::progress(5, 3, 10)), ApplyOutcome::Dropped);
        }

        let ticket = registry.begin_submission();
        assert!(ticket.register(InstallSession::new(5, "maps")).is_empty());
        assert_eq!(registry.get(5).unwrap().status, SessionStatus::Pending);
    }

    #[test]
    fn test_retry_reservation() {
        let registry = registry_with(&[(7, "maps")]);
        let policy = RetryPolicy::unbounded();

        let RetryDecision::Issue(session) = registry.begin_retry(7, &policy) else {
            panic!("expected a retry to be issued");
        };
        assert_eq!(session.module_name, "maps");
        assert_eq!(registry.begin_retry(7, &policy), RetryDecision::InFlight);

        registry.finish_retry(7, Some(8));
        assert_eq!(registry.begin_retry(7, &policy), RetryDecision::Superseded(8));
        assert_eq!(registry.begin_retry(99, &policy), RetryDecision::NotActive);
    }

    #[test]
    fn test_failed_retry_can_be_reissued() {
        let registry = registry_with(&[(7, "maps")]);
        let policy = RetryPolicy::unbounded();
        assert!(matches!(registry.begin_retry(7, &policy), RetryDecision::Issue(_)));
        registry.finish_retry(7, None);
        assert!(matches!(registry.begin_retry(7, &policy), RetryDecision::Issue(_)));
    }

    #[test]
    fn test_exhausted_retry_fails_session() {
        let registry = registry_with(&[(7, "maps")]);
        let policy = RetryPolicy {
            max_retries: Some(0),
            backoff_ms: 0,
        };
        let RetryDecision::Exhausted(session) = registry.begin_retry(7, &policy) else {
            panic!("expected retry budget to be exhausted");
        };
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.error_code, Some(ErrorCode::ServiceDied));
        assert!(registry.list_active().is_empty());
    }

    #[test]
    fn test_lineage_retires_together() {
        let registry = registry_with(&[(7, "maps")]);
        {
            let ticket = registry.begin_submission();
            let original = registry.get(7).unwrap();
            ticket.register(InstallSession::resubmitted(8, &original));
        }
        registry.finish_retry(7, Some(8));
        assert_eq!(registry.active_count(), 2);

        let outcome = registry.apply(&SessionState::new(8, BackendStatus::Installed));
        let ApplyOutcome::Applied { superseded, .. } = outcome else {
            panic!("expected install to apply");
        };
        assert_eq!(superseded, vec![7]);
        assert!(registry.list_active().is_empty());
        assert!(registry.is_retired(7));
    }

    fn resubmit(registry: &SessionRegistry, previous: SessionId, next: SessionId) {
        let policy = RetryPolicy::unbounded();
        let RetryDecision::Issue(original) = registry.begin_retry(previous, &policy) else {
            panic!("expected a retry to be issued");
        };
        {
            let ticket = registry.begin_submission();
            ticket.register(InstallSession::resubmitted(next, &original));
        }
        assert!(registry.finish_retry(previous, Some(next)));
    }

    #[test]
    fn test_live_session_follows_replacements() {
        let registry = registry_with(&[(6, "maps")]);
        resubmit(&registry, 6, 7);
        resubmit(&registry, 7, 8);

        assert_eq!(registry.live_session(6), Some(8));
        assert_eq!(registry.live_session(7), Some(8));
        assert_eq!(registry.live_session(8), Some(8));
        assert_eq!(registry.live_session(99), None);
        assert!(registry.is_superseded(6));
        assert!(!registry.is_superseded(8));

        let live: Vec<SessionId> = registry
            .resync_candidates()
            .iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(live, vec![8]);
    }

    #[test]
    fn test_replaced_session_retires_silently() {
        let registry = registry_with(&[(6, "maps")]);
        resubmit(&registry, 6, 7);
        resubmit(&registry, 7, 8);

        // Late progress for a replaced session changes nothing.
        assert_eq!(registry.apply(&SessionState::progress(7, 5, 10)), ApplyOutcome::Ignored);
        assert_eq!(registry.get(7).unwrap().bytes_downloaded, 0);

        assert_eq!(
            registry.apply(&SessionState::new(7, BackendStatus::Canceled)),
            ApplyOutcome::Retired {
                session_id: 7,
                replacement: 8
            }
        );
        assert!(registry.is_retired(7));
        assert_eq!(registry.live_session(6), Some(8));
        assert!(registry.get(8).is_some());

        // The rest of the lineage still retires with the live session.
        let ApplyOutcome::Applied { superseded, .. } =
            registry.apply(&SessionState::new(8, BackendStatus::Installed))
        else {
            panic!("expected install to apply");
        };
        assert_eq!(superseded, vec![6]);
        assert!(registry.list_active().is_empty());
    }

    #[test]
    fn test_finish_retry_reports_ended_session() {
        let registry = registry_with(&[(7, "maps")]);
        assert!(matches!(
            registry.begin_retry(7, &RetryPolicy::unbounded()),
            RetryDecision::Issue(_)
        ));
        registry.apply(&SessionState::new(7, BackendStatus::Canceled));
        assert!(!registry.finish_retry(7, Some(8)));
    }
}
