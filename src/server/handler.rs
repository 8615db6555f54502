// Axum request handlers: translate UI-shell HTTP calls into install manager operations.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::engine::manager::InstallManager;
use crate::engine::session::SessionId;
use crate::error::{CancelError, SubmissionError};

pub struct ControlServer {
    port: u16,
    manager: Arc<InstallManager>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ControlServer {
    /// Start the control server on a random loopback port, returning a handle.
    pub async fn start(manager: Arc<InstallManager>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = Router::new()
            .route("/modules/{module_name}", get(module_handler))
            .route("/modules/{module_name}/install", post(install_handler))
            .route("/sessions", get(sessions_handler))
            .route("/sessions/{session_id}", delete(cancel_handler))
            .route("/stats", get(stats_handler))
            .with_state(manager.clone());

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                error!("control server stopped: {}", e);
            }
        });

        info!("control server listening on 127.0.0.1:{}", port);
        Ok(Self {
            port,
            manager,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Absolute URL for a path on this server, e.g. `/sessions`.
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn manager(&self) -> &Arc<InstallManager> {
        &self.manager
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    session_id: SessionId,
}

#[derive(Debug, Serialize)]
struct ModuleResponse {
    module: String,
    installed: bool,
}

fn submission_status(err: &SubmissionError) -> StatusCode {
    match err {
        SubmissionError::EmptyModuleName => StatusCode::BAD_REQUEST,
        SubmissionError::Network => StatusCode::SERVICE_UNAVAILABLE,
        SubmissionError::ActiveSessionsLimitExceeded => StatusCode::CONFLICT,
        SubmissionError::Internal | SubmissionError::Unknown(_) => StatusCode::BAD_GATEWAY,
    }
}

fn cancel_status(err: &CancelError) -> StatusCode {
    match err {
        CancelError::UnknownSession(_) => StatusCode::NOT_FOUND,
        CancelError::AlreadyTerminal(_) => StatusCode::CONFLICT,
        CancelError::Backend(_) => StatusCode::BAD_GATEWAY,
    }
}

/// POST /modules/{module_name}/install: submit an install request.
async fn install_handler(
    State(manager): State<Arc<InstallManager>>,
    Path(module_name): Path<String>,
) -> Response {
    match manager.submit(&module_name).await {
        Ok(session_id) => (StatusCode::ACCEPTED, Json(SubmitResponse { session_id })).into_response(),
        Err(e) => {
            debug!("install request for {:?} refused: {}", module_name, e);
            (submission_status(&e), e.to_string()).into_response()
        }
    }
}

/// GET /modules/{module_name}: installed check.
async fn module_handler(
    State(manager): State<Arc<InstallManager>>,
    Path(module_name): Path<String>,
) -> Response {
    let installed = manager.is_installed(&module_name);
    Json(ModuleResponse {
        module: module_name,
        installed,
    })
    .into_response()
}

/// GET /sessions: snapshot of active sessions.
async fn sessions_handler(State(manager): State<Arc<InstallManager>>) -> Response {
    Json(manager.list_active()).into_response()
}

/// DELETE /sessions/{session_id}: cancel an in-flight session.
async fn cancel_handler(
    State(manager): State<Arc<InstallManager>>,
    Path(session_id): Path<SessionId>,
) -> Response {
    match manager.cancel(session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (cancel_status(&e), e.to_string()).into_response(),
    }
}

/// GET /stats: manager counters.
async fn stats_handler(State(manager): State<Arc<InstallManager>>) -> Response {
    Json(manager.stats()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_submission_status_mapping() {
        assert_eq!(
            submission_status(&SubmissionError::EmptyModuleName),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            submission_status(&SubmissionError::Network),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            submission_status(&SubmissionError::ActiveSessionsLimitExceeded),
            StatusCode::CONFLICT
        );
        assert_eq!(
            submission_status(&SubmissionError::Unknown(-2)),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_cancel_status_mapping() {
        assert_eq!(cancel_status(&CancelError::UnknownSession(1)), StatusCode::NOT_FOUND);
        assert_eq!(cancel_status(&CancelError::AlreadyTerminal(1)), StatusCode::CONFLICT);
        assert_eq!(
            cancel_status(&CancelError::Backend(ErrorCode::InternalError)),
            StatusCode::BAD_GATEWAY
        );
    }
}
