//! Error taxonomy shared across the scheduler.
//!
//! Collaborator errors are mapped into these kinds at the ports; nothing
//! raw propagates outward. Expected scheduling outcomes (no fit, cap hit)
//! are not errors at all and are reported through contexts instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulingError {
    // Transient: the caller retries with backoff; a round hitting one of
    // these aborts without mutating node DB or report store.
    #[error("job database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("event broker error: {0}")]
    BrokerError(String),

    #[error("rpc timeout after {0}ms")]
    RpcTimeout(u64),

    // Validation: rejected at ingress, recorded as terminal, never retried.
    #[error("invalid argument {name}: {message}")]
    InvalidArgument { name: String, message: String },

    #[error("malformed job {job_id}: {message}")]
    MalformedJob { job_id: String, message: String },

    // Resource: expected and non-fatal; surfaced in reports.
    #[error("insufficient {resource}")]
    InsufficientResources { resource: String },

    // Fatal: scheduling stays disabled until restart.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

impl SchedulingError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedulingError::DatabaseUnavailable(_)
                | SchedulingError::BrokerError(_)
                | SchedulingError::RpcTimeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SchedulingError::InvariantViolation(_))
    }

    pub fn invalid_argument(name: &str, message: impl Into<String>) -> Self {
        SchedulingError::InvalidArgument {
            name: name.to_string(),
            message: message.into(),
        }
    }
}
