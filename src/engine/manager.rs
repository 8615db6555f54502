// Install manager: submits module requests and drives sessions from backend events.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::confirmation::{ConfirmationGate, ConfirmationResult};
use super::installed::InstalledModules;
use super::policy::{CancelDownloading, ConflictDecision, ConflictPolicy, ConflictReport};
use super::registry::{ApplyOutcome, RetryDecision, SessionRegistry};
use super::session::{InstallSession, SessionId, Transition};
use super::stats::{StatsCollector, StatsSnapshot};
use super::updates::{InstallUpdate, Subscription};
use crate::backend::traits::{BackendStatus, InstallBackend, SessionState};
use crate::config::ManagerConfig;
use crate::error::{CancelError, ErrorCode, SubmissionError};

pub struct InstallManager {
    backend: Arc<dyn InstallBackend>,
    config: ManagerConfig,
    registry: SessionRegistry,
    gate: ConfirmationGate,
    installed: InstalledModules,
    policy: Box<dyn ConflictPolicy>,
    stats: StatsCollector,
    updates: broadcast::Sender<InstallUpdate>,
    listener: Mutex<Option<CancellationToken>>,
}

impl InstallManager {
    pub fn new(backend: Arc<dyn InstallBackend>, config: ManagerConfig) -> Arc<Self> {
        Self::with_policy(backend, config, CancelDownloading)
    }

    pub fn with_policy(
        backend: Arc<dyn InstallBackend>,
        config: ManagerConfig,
        policy: impl ConflictPolicy + 'static,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(config.update_channel_capacity.max(1));
        Arc::new(Self {
            backend,
            registry: SessionRegistry::new(config.early_event_buffer),
            config,
            gate: ConfirmationGate::new(),
            installed: InstalledModules::new(),
            policy: Box::new(policy),
            stats: StatsCollector::new(),
            updates,
            listener: Mutex::new(None),
        })
    }

    /// Request installation of a module. On success the session is tracked
    /// and its progress is published to subscribers.
    pub async fn submit(self: &Arc<Self>, module_name: &str) -> Result<SessionId, SubmissionError> {
        if module_name.trim().is_empty() {
            return Err(SubmissionError::EmptyModuleName);
        }

        self.ensure_listener();
        match self.submit_session(module_name, None).await {
            Ok(session) => Ok(session.session_id),
            Err(SubmissionError::ActiveSessionsLimitExceeded) => {
                if self.config.resolve_conflicts_on_limit {
                    self.resolve_conflicts().await;
                }
                Err(SubmissionError::ActiveSessionsLimitExceeded)
            }
            Err(e) => Err(e),
        }
    }

    async fn submit_session(
        self: &Arc<Self>,
        module_name: &str,
        previous: Option<&InstallSession>,
    ) -> Result<InstallSession, SubmissionError> {
        let ticket = self.registry.begin_submission();

        let session_id = match self.backend.start_install(module_name).await {
            Ok(session_id) => session_id,
            Err(code) => {
                self.stats.record_rejected();
                warn!("install request for {} rejected: {}", module_name, code);
                return Err(code.into());
            }
        };

        let session = match previous {
            Some(previous) => InstallSession::resubmitted(session_id, previous),
            None => InstallSession::new(session_id, module_name),
        };
        let replayed = ticket.register(session.clone());
        drop(ticket);
        self.stats.record_submitted();

        let mut orphaned = false;
        match previous {
            Some(previous) => {
                orphaned = !self
                    .registry
                    .finish_retry(previous.session_id, Some(session_id));
                self.stats.record_resubmitted();
                info!(
                    "session {} ({}) resubmitted as {} (attempt {})",
                    previous.session_id, module_name, session_id, session.attempt
                );
                self.publish(InstallUpdate::Resubmitted {
                    previous: previous.session_id,
                    session: session.clone(),
                });
            }
            None => {
                info!("session {} started for module {}", session_id, module_name);
                self.publish(InstallUpdate::Submitted(session.clone()));
            }
        }

        for outcome in replayed {
            self.handle_outcome(outcome);
        }

        if orphaned {
            info!(
                "request ended while resubmitting, canceling replacement session {}",
                session_id
            );
            if let Err(code) = self.backend.cancel_install(session_id).await {
                warn!("could not cancel replacement session {}: {}", session_id, code);
            }
        }
        Ok(session)
    }

    /// Register the backend listener unless one is already running.
    fn ensure_listener(self: &Arc<Self>) {
        let mut slot = self.listener.lock();
        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let mut events = self.backend.subscribe();
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => Some(event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!("install listener lagged, {} state events lost", missed);
                            None
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match event {
                    Some(event) => manager.handle_event(&event),
                    None => manager.resync().await,
                }
            }
            debug!("install listener stopped");
        });

        *slot = Some(token);
        info!("install listener registered");
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Unregister the backend listener and stop pending resubmissions.
    /// A later `submit` registers a fresh listener.
    pub fn shutdown(&self) {
        if let Some(token) = self.listener.lock().take() {
            token.cancel();
            info!("install listener unregistered");
        }
    }

    /// Feed one backend state event through the tracker. Spawns follow-up
    /// work, so it runs on the listener task.
    fn handle_event(self: &Arc<Self>, event: &SessionState) {
        if event.is_service_died() {
            self.on_service_died(event.session_id);
            return;
        }
        let outcome = self.registry.apply(event);
        if outcome == ApplyOutcome::Dropped {
            debug!(
                "dropping {:?} event for untracked session {}",
                event.status, event.session_id
            );
        }
        self.handle_outcome(outcome);
    }

    fn handle_outcome(self: &Arc<Self>, outcome: ApplyOutcome) {
        let (session, transition, superseded) = match outcome {
            ApplyOutcome::Applied {
                session,
                transition,
                superseded,
            } => (session, transition, superseded),
            ApplyOutcome::Ignored | ApplyOutcome::Buffered => return,
            ApplyOutcome::Retired {
                session_id,
                replacement,
            } => {
                self.gate.release(session_id);
                debug!(
                    "session {} retired quietly, request continues as {}",
                    session_id, replacement
                );
                return;
            }
            ApplyOutcome::Dropped => {
                self.stats.record_dropped_event();
                return;
            }
        };

        let session_id = session.session_id;
        match transition {
            Transition::Progress => {
                debug!(
                    "session {} ({}) downloading {}/{} bytes",
                    session_id, session.module_name, session.bytes_downloaded, session.total_bytes
                );
                self.publish(InstallUpdate::Progress(session));
            }
            Transition::ConfirmationRequired => self.request_confirmation(session),
            Transition::Installing => self.publish(InstallUpdate::Installing(session)),
            Transition::Installed => {
                self.installed.mark_installed(&session.module_name);
                self.stats.record_installed();
                info!("session {} installed module {}", session_id, session.module_name);
                self.publish(InstallUpdate::Installed(session));
            }
            Transition::Failed(error) => {
                self.stats.record_failed();
                warn!(
                    "session {} ({}) failed: {}",
                    session_id, session.module_name, error
                );
                self.publish(InstallUpdate::Failed { session, error });
            }
            Transition::Canceled => {
                self.stats.record_canceled();
                info!("session {} ({}) canceled", session_id, session.module_name);
                self.publish(InstallUpdate::Canceled(session));
            }
        }

        if transition.is_terminal() {
            self.gate.release(session_id);
            for retired in superseded {
                self.gate.release(retired);
                debug!("session {} retired with its replacement {}", retired, session_id);
            }
        }
    }

    fn on_service_died(self: &Arc<Self>, session_id: SessionId) {
        let policy = self.config.service_died_retry;
        let session = match self.registry.begin_retry(session_id, &policy) {
            RetryDecision::Issue(session) => session,
            RetryDecision::InFlight => {
                debug!("session {} resubmission already in flight", session_id);
                return;
            }
            RetryDecision::Superseded(next) => {
                debug!("session {} already replaced by {}", session_id, next);
                return;
            }
            RetryDecision::Exhausted(session) => {
                self.gate.release(session_id);
                self.stats.record_failed();
                warn!(
                    "session {} ({}) gave up after {} resubmissions",
                    session_id, session.module_name, session.attempt
                );
                self.publish(InstallUpdate::Failed {
                    session,
                    error: ErrorCode::ServiceDied,
                });
                return;
            }
            RetryDecision::NotActive => {
                self.stats.record_dropped_event();
                debug!("service died for untracked session {}", session_id);
                return;
            }
        };

        let attempt = session.attempt + 1;
        let delay = policy.backoff_for(attempt);
        warn!(
            "session {} ({}) lost the install service, resubmitting in {:?} (attempt {})",
            session_id, session.module_name, delay, attempt
        );

        let token = self.listener.lock().clone().unwrap_or_default();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    manager.registry.finish_retry(session_id, None);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if manager.registry.get(session_id).is_none() {
                debug!("session {} ended before its resubmission", session_id);
                return;
            }
            if let Err(e) = manager
                .submit_session(&session.module_name, Some(&session))
                .await
            {
                warn!("resubmission of session {} failed: {}", session_id, e);
                manager.registry.finish_retry(session_id, None);
            }
        });
    }

    fn request_confirmation(self: &Arc<Self>, session: InstallSession) {
        let session_id = session.session_id;
        let (responder, rx) = match self.gate.request_confirmation(&session) {
            Ok(pair) => pair,
            Err(e) => {
                debug!("not presenting confirmation: {}", e);
                return;
            }
        };

        if let Err(code) = self.backend.present_confirmation(&session, responder) {
            warn!("could not present confirmation for session {}: {}", session_id, code);
            self.gate.release(session_id);
            return;
        }
        self.publish(InstallUpdate::ConfirmationRequired(session));

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match rx.await {
                Ok(result) => manager.on_confirmation_result(session_id, result),
                Err(_) => {
                    warn!("confirmation for session {} abandoned", session_id);
                    manager.gate.release(session_id);
                }
            }
        });
    }

    fn on_confirmation_result(self: &Arc<Self>, session_id: SessionId, result: ConfirmationResult) {
        self.gate.release(session_id);
        let accepted = result.is_accepted();
        info!(
            "session {} confirmation {} (code {})",
            session_id,
            if accepted { "accepted" } else { "declined" },
            result.code
        );

        let outcome = self.registry.resolve_confirmation(session_id, accepted);
        let declined = matches!(
            outcome,
            ApplyOutcome::Applied {
                transition: Transition::Canceled,
                ..
            }
        );
        self.handle_outcome(outcome);

        if declined {
            let backend = Arc::clone(&self.backend);
            tokio::spawn(async move {
                if let Err(code) = backend.cancel_install(session_id).await {
                    debug!("backend cancel after declined confirmation {}: {}", session_id, code);
                }
            });
        }
    }

    /// Ask the backend to cancel an in-flight session. The session is retired
    /// once the backend reports it canceled.
    /// An id that was resubmitted after ServiceDied cancels the session now
    /// carrying its request.
    pub async fn cancel(&self, session_id: SessionId) -> Result<(), CancelError> {
        let Some(live) = self.registry.live_session(session_id) else {
            return Err(if self.registry.is_retired(session_id) {
                CancelError::AlreadyTerminal(session_id)
            } else {
                CancelError::UnknownSession(session_id)
            });
        };
        self.backend
            .cancel_install(live)
            .await
            .map_err(CancelError::Backend)?;
        if live == session_id {
            info!("cancel requested for session {}", session_id);
        } else {
            info!("cancel requested for session {} (replacing {})", live, session_id);
        }
        Ok(())
    }

    /// Run the conflict policy over every session the backend reports active.
    pub async fn resolve_conflicts(&self) -> ConflictReport {
        let sessions = match self.backend.list_active_sessions().await {
            Ok(sessions) => sessions,
            Err(code) => {
                warn!("listing backend sessions failed ({}), using local registry", code);
                self.registry.list_active()
            }
        };

        let mut report = ConflictReport::default();
        for session in sessions {
            if self.registry.is_superseded(session.session_id) {
                debug!("skipping replaced session {}", session.session_id);
                continue;
            }
            match self.policy.decide(&session) {
                ConflictDecision::Cancel => {
                    match self.backend.cancel_install(session.session_id).await {
                        Ok(()) => report.canceled.push(session.session_id),
                        Err(code) => {
                            warn!("could not cancel session {}: {}", session.session_id, code)
                        }
                    }
                }
                ConflictDecision::Defer => report.deferred.push(session.session_id),
            }
        }

        info!(
            "session conflicts resolved: canceled={:?} deferred={:?}",
            report.canceled, report.deferred
        );
        self.publish(InstallUpdate::ConflictsResolved(report.clone()));
        report
    }

    /// Catch up after the listener missed events. Sessions the backend still
    /// lists take its current state; sessions it no longer lists are settled
    /// from the installed set, and count as failed otherwise.
    async fn resync(self: &Arc<Self>) {
        let tracked = self.registry.resync_candidates();
        if tracked.is_empty() {
            return;
        }
        let listed = match self.backend.list_active_sessions().await {
            Ok(sessions) => sessions
                .into_iter()
                .map(|session| (session.session_id, session))
                .collect::<HashMap<SessionId, InstallSession>>(),
            Err(code) => {
                warn!("resync skipped, listing backend sessions failed: {}", code);
                return;
            }
        };

        let mut installed = None;
        for session in tracked {
            let session_id = session.session_id;
            let event = match listed.get(&session_id) {
                Some(current) => SessionState::from(current),
                None => {
                    let known = installed.get_or_insert_with(|| self.backend.installed_modules());
                    if known.contains(&session.module_name) {
                        SessionState::new(session_id, BackendStatus::Installed)
                    } else {
                        SessionState::failed(session_id, ErrorCode::InternalError)
                    }
                }
            };
            debug!("resync session {} -> {:?}", session_id, event.status);
            self.handle_event(&event);
        }
    }

    pub fn is_installed(&self, module_name: &str) -> bool {
        self.installed.is_installed(self.backend.as_ref(), module_name)
    }

    pub fn list_active(&self) -> Vec<InstallSession> {
        self.registry.list_active()
    }

    pub fn session(&self, session_id: SessionId) -> Option<InstallSession> {
        self.registry.get(session_id)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.updates.subscribe(), CancellationToken::new())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.registry.active_count())
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn publish(&self, update: InstallUpdate) {
        // No subscribers is not an error.
        let _ = self.updates.send(update);
    }
}

impl Drop for InstallManager {
    fn drop(&mut self) {
        if let Some(token) = self.listener.get_mut().take() {
            token.cancel();
        }
    }
}
