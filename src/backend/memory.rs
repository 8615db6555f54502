// Scriptable in-process install backend: stands in for the platform service in
// tests, demos and UI previews.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::traits::{BackendStatus, InstallBackend, SessionState};
use crate::engine::confirmation::{ConfirmationResponder, ConfirmationResult};
use crate::engine::session::{InstallSession, SessionId};
use crate::error::ErrorCode;

/// Backend code for a module name it does not know.
pub const RAW_MODULE_UNAVAILABLE: i32 = -2;
/// Backend code for a session id it does not know.
pub const RAW_SESSION_NOT_FOUND: i32 = -4;

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct BackendState {
    next_session_id: SessionId,
    active_limit: usize,
    sessions: HashMap<SessionId, InstallSession>,
    installed: HashSet<String>,
    scripted_failures: VecDeque<ErrorCode>,
    early_events: VecDeque<SessionState>,
    confirmations: HashMap<SessionId, ConfirmationResponder>,
    start_calls: Vec<String>,
    cancel_calls: Vec<SessionId>,
    installed_queries: usize,
}

pub struct InMemoryBackend {
    available: HashSet<String>,
    state: Mutex<BackendState>,
    events: broadcast::Sender<SessionState>,
}

impl InMemoryBackend {
    /// A backend that knows how to install the given modules.
    pub fn new<I, S>(available: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            available: available.into_iter().map(Into::into).collect(),
            state: Mutex::new(BackendState {
                next_session_id: 1,
                active_limit: usize::MAX,
                sessions: HashMap::new(),
                installed: HashSet::new(),
                scripted_failures: VecDeque::new(),
                early_events: VecDeque::new(),
                confirmations: HashMap::new(),
                start_calls: Vec::new(),
                cancel_calls: Vec::new(),
                installed_queries: 0,
            }),
            events,
        }
    }

    /// Size of the state event channel; slow listeners lag past it.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = broadcast::channel(capacity.max(1)).0;
        self
    }

    /// Refuse new requests while this many sessions are active.
    pub fn with_active_limit(mut self, limit: usize) -> Self {
        self.state.get_mut().active_limit = limit;
        self
    }

    pub fn with_first_session_id(mut self, session_id: SessionId) -> Self {
        self.state.get_mut().next_session_id = session_id;
        self
    }

    pub fn with_installed<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .get_mut()
            .installed
            .extend(modules.into_iter().map(Into::into));
        self
    }

    /// Fail the next submission with `code` instead of starting a session.
    pub fn fail_next_submission(&self, code: ErrorCode) {
        self.state.lock().scripted_failures.push_back(code);
    }

    /// Queue an event that is broadcast while the next submission is still
    /// in progress, before its session id is handed back.
    pub fn push_early_event(&self, event: SessionState) {
        self.state.lock().early_events.push_back(event);
    }

    /// Broadcast a state event, updating the backend's own bookkeeping first.
    pub fn emit(&self, event: SessionState) {
        {
            let mut state = self.state.lock();
            Self::record(&mut state, &event);
        }
        if self.events.send(event).is_err() {
            debug!("state event emitted with no listeners");
        }
    }

    /// Mark a module installed without any session, e.g. by another process.
    pub fn install_out_of_band(&self, module_name: &str) {
        self.state.lock().installed.insert(module_name.to_string());
    }

    /// Answer the pending confirmation prompt for a session.
    pub fn confirm(&self, session_id: SessionId, result: ConfirmationResult) -> bool {
        let responder = self.state.lock().confirmations.remove(&session_id);
        match responder {
            Some(responder) => responder.complete(result),
            None => false,
        }
    }

    /// Drop the pending prompt without answering it.
    pub fn dismiss_confirmation(&self, session_id: SessionId) -> bool {
        self.state.lock().confirmations.remove(&session_id).is_some()
    }

    pub fn has_pending_confirmation(&self, session_id: SessionId) -> bool {
        self.state.lock().confirmations.contains_key(&session_id)
    }

    pub fn start_calls(&self) -> Vec<String> {
        self.state.lock().start_calls.clone()
    }

    pub fn cancel_calls(&self) -> Vec<SessionId> {
        self.state.lock().cancel_calls.clone()
    }

    pub fn installed_queries(&self) -> usize {
        self.state.lock().installed_queries
    }

    fn record(state: &mut BackendState, event: &SessionState) {
        if event.is_service_died() {
            return;
        }
        let Some(session) = state.sessions.get_mut(&event.session_id) else {
            return;
        };
        session.apply(event);
        if event.status == BackendStatus::Installed {
            let module_name = session.module_name.clone();
            state.installed.insert(module_name);
        }
        if event.status.is_terminal() {
            state.sessions.remove(&event.session_id);
            state.confirmations.remove(&event.session_id);
        }
    }
}

#[async_trait]
impl InstallBackend for InMemoryBackend {
    async fn start_install(&self, module_name: &str) -> Result<SessionId, ErrorCode> {
        let (session_id, early_events) = {
            let mut state = self.state.lock();
            state.start_calls.push(module_name.to_string());

            if let Some(code) = state.scripted_failures.pop_front() {
                return Err(code);
            }
            if !self.available.contains(module_name) {
                return Err(ErrorCode::Unknown(RAW_MODULE_UNAVAILABLE));
            }
            if state.sessions.len() >= state.active_limit {
                return Err(ErrorCode::ActiveSessionsLimitExceeded);
            }

            let session_id = state.next_session_id;
            state.next_session_id += 1;
            state
                .sessions
                .insert(session_id, InstallSession::new(session_id, module_name));
            let early_events: Vec<SessionState> = state.early_events.drain(..).collect();
            (session_id, early_events)
        };

        for event in early_events {
            self.emit(event);
        }
        // Let the listener observe early events before the id is returned.
        tokio::task::yield_now().await;
        Ok(session_id)
    }

    async fn cancel_install(&self, session_id: SessionId) -> Result<(), ErrorCode> {
        let known = {
            let mut state = self.state.lock();
            state.cancel_calls.push(session_id);
            state.sessions.contains_key(&session_id)
        };
        if !known {
            return Err(ErrorCode::Unknown(RAW_SESSION_NOT_FOUND));
        }
        self.emit(SessionState::new(session_id, BackendStatus::Canceled));
        Ok(())
    }

    async fn list_active_sessions(&self) -> Result<Vec<InstallSession>, ErrorCode> {
        let state = self.state.lock();
        let mut sessions: Vec<InstallSession> = state.sessions.values().cloned().collect();
        sessions.sort_by_key(|session| session.session_id);
        Ok(sessions)
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.events.subscribe()
    }

    fn installed_modules(&self) -> HashSet<String> {
        let mut state = self.state.lock();
        state.installed_queries += 1;
        state.installed.clone()
    }

    fn present_confirmation(
        &self,
        session: &InstallSession,
        responder: ConfirmationResponder,
    ) -> Result<(), ErrorCode> {
        self.state
            .lock()
            .confirmations
            .insert(session.session_id, responder);
        Ok(())
    }
}
