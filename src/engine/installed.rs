// Installed-module lookup: a positive-only cache over the backend's installed set.

use std::collections::HashSet;

use parking_lot::RwLock;
use tracing::debug;

use crate::backend::traits::InstallBackend;

#[derive(Default)]
pub struct InstalledModules {
    known: RwLock<HashSet<String>>,
}

impl InstalledModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Membership check. A cached hit is trusted; a miss always asks the
    /// backend, so "not installed" is never served from cache.
    pub fn is_installed(&self, backend: &dyn InstallBackend, module_name: &str) -> bool {
        if self.known.read().contains(module_name) {
            return true;
        }

        // Merge, never replace: an INSTALLED event may land while the backend
        // set is being read.
        let fresh = backend.installed_modules();
        let mut known = self.known.write();
        known.extend(fresh);
        let installed = known.contains(module_name);
        debug!(
            "installed set refreshed: {} modules, {} installed={}",
            known.len(),
            module_name,
            installed
        );
        installed
    }

    /// Record a module reported INSTALLED by a session event.
    pub fn mark_installed(&self, module_name: &str) {
        self.known.write().insert(module_name.to_string());
    }

    /// Forget everything; the next lookup goes to the backend.
    pub fn invalidate(&self) {
        self.known.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use crate::backend::traits::SessionState;
    use crate::engine::confirmation::ConfirmationResponder;
    use crate::engine::session::{InstallSession, SessionId};
    use crate::error::ErrorCode;

    /// Backend whose installed set trails the INSTALLED event: the event is
    /// handled while the set is being read.
    struct TrailingBackend<'a> {
        cache: &'a InstalledModules,
        module_name: &'static str,
    }

    #[async_trait]
    impl<'a> InstallBackend for TrailingBackend<'a> {
        async fn start_install(&self, _module_name: &str) -> Result<SessionId, ErrorCode> {
            Err(ErrorCode::InternalError)
        }

        async fn cancel_install(&self, _session_id: SessionId) -> Result<(), ErrorCode> {
            Ok(())
        }

        async fn list_active_sessions(&self) -> Result<Vec<InstallSession>, ErrorCode> {
            Ok(Vec::new())
        }

        fn subscribe(&self) -> broadcast::Receiver<SessionState> {
            broadcast::channel(1).1
        }

        fn installed_modules(&self) -> HashSet<String> {
            self.cache.mark_installed(self.module_name);
            HashSet::new()
        }

        fn present_confirmation(
            &self,
            _session: &InstallSession,
            _responder: ConfirmationResponder,
        ) -> Result<(), ErrorCode> {
            Ok(())
        }
    }

    #[test]
    fn test_install_event_during_refresh_is_kept() {
        let installed = InstalledModules::new();
        let backend = TrailingBackend {
            cache: &installed,
            module_name: "maps",
        };

        assert!(installed.is_installed(&backend, "maps"));
        assert!(installed.is_installed(&backend, "maps"));
        assert!(!installed.is_installed(&backend, "camera"));
    }

    #[test]
    fn test_positive_answers_are_cached() {
        let backend = InMemoryBackend::new(["maps"]).with_installed(["camera"]);
        let installed = InstalledModules::new();

        assert!(installed.is_installed(&backend, "camera"));
        assert!(installed.is_installed(&backend, "camera"));
        assert_eq!(backend.installed_queries(), 1);

        installed.invalidate();
        assert!(installed.is_installed(&backend, "camera"));
        assert_eq!(backend.installed_queries(), 2);
    }

    #[test]
    fn test_mark_installed_skips_backend() {
        let backend = InMemoryBackend::new(["maps"]);
        let installed = InstalledModules::new();

        assert!(!installed.is_installed(&backend, "maps"));
        assert!(!installed.is_installed(&backend, "maps"));
        assert_eq!(backend.installed_queries(), 2);

        installed.mark_installed("maps");
        assert!(installed.is_installed(&backend, "maps"));
        assert_eq!(backend.installed_queries(), 2);
    }
}
