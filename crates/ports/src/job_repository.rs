//! Job Store Port
//!
//! Read-only access to the persistent job database. The core never writes
//! run state directly; it emits intents through the event publisher.

use async_trait::async_trait;
use stevedore_core::{Job, JobId, SchedulingError};

/// Job store port
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Fetch up to `limit` pending jobs in submission order. Callers page
    /// through the backlog by repeating the call with `after`.
    async fn fetch_pending(
        &self,
        after: Option<JobId>,
        limit: usize,
    ) -> Result<Vec<Job>, JobRepositoryError>;
}

/// Job store error
#[derive(thiserror::Error, Debug)]
pub enum JobRepositoryError {
    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("query timed out after {0}ms")]
    Timeout(u64),
}

impl From<JobRepositoryError> for SchedulingError {
    fn from(err: JobRepositoryError) -> Self {
        match err {
            JobRepositoryError::Unavailable(message) => {
                SchedulingError::DatabaseUnavailable(message)
            }
            JobRepositoryError::Timeout(ms) => SchedulingError::RpcTimeout(ms),
        }
    }
}
