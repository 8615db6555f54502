// On-demand feature module delivery: session-tracked install manager.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod telemetry;

pub use backend::traits::{BackendStatus, InstallBackend, SessionState};
pub use config::{ManagerConfig, RetryPolicy};
pub use engine::manager::InstallManager;
pub use engine::session::{InstallSession, SessionId, SessionStatus};
pub use error::{CancelError, ConfirmationError, ErrorCode, SubmissionError};
