use thiserror::Error;

use crate::gateway::GatewayError;
use crate::job::JobState;

/// Result alias used by the caller-facing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the caller-facing layer.
#[derive(Debug, Error)]
pub enum Error {
    /// No job with this id is registered (never existed, cancelled or purged).
    #[error("job {0} not found")]
    JobNotFound(String),

    /// The job exists but the requested operation is not allowed in its state.
    #[error("job {id} is {state}, cannot cancel")]
    InvalidState {
        /// Job id.
        id: String,
        /// State the job was observed in.
        state: JobState,
    },

    /// The backend rejected or failed a request.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Failure of a single execution attempt.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// No inventory entry matches the requested name. Caller input error,
    /// never retried.
    #[error("device '{requested}' not found; available devices: [{}]", .available.join(", "))]
    DeviceNotFound {
        /// Name the caller asked for.
        requested: String,
        /// Every device name in the inventory snapshot.
        available: Vec<String>,
    },

    /// Authenticating or listing devices failed.
    #[error("session refresh failed: {0}")]
    Session(GatewayError),

    /// Delivering the command failed.
    #[error("command failed: {0}")]
    Command(GatewayError),
}

impl ExecError {
    /// The gateway failure behind this error, if any.
    pub fn gateway(&self) -> Option<&GatewayError> {
        match self {
            ExecError::DeviceNotFound { .. } => None,
            ExecError::Session(e) | ExecError::Command(e) => Some(e),
        }
    }

    /// True when the backend rejected the credential.
    pub fn is_auth(&self) -> bool {
        matches!(self.gateway(), Some(GatewayError::Auth(_)))
    }
}
