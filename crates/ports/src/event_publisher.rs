//! Event Publication Port
//!
//! The core records scheduling decisions as *intents* on a single topic.
//! Implementations guarantee: (a) sequences with the same `job_set` land on
//! the same partition, preserving per-set ordering; (b) at-least-once
//! delivery, retrying broker errors and surfacing the first irrecoverable
//! one; (c) after a round, one marker per partition so consumers can detect
//! round completion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stevedore_core::{JobId, SchedulingError};
use uuid::Uuid;

/// A scheduling decision to be applied by downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobRunEvent {
    Leased {
        job_id: JobId,
        run_id: Uuid,
        executor_id: String,
        node_id: String,
    },
    Preempted {
        job_id: JobId,
        run_id: Uuid,
        reason: String,
    },
    Cancelled {
        job_id: JobId,
        run_id: Uuid,
    },
    Errored {
        job_id: JobId,
        message: String,
    },
}

/// An ordered batch of events for one job set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSequence {
    pub job_set: String,
    pub events: Vec<JobRunEvent>,
}

/// Event publication port
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish the given sequences, keyed by job set.
    async fn publish(&self, sequences: Vec<EventSequence>) -> Result<(), EventPublisherError>;

    /// Publish a round-completion marker to every partition. Returns the
    /// number of partitions marked.
    async fn publish_markers(&self, round_id: Uuid) -> Result<usize, EventPublisherError>;
}

/// Event publication error
#[derive(thiserror::Error, Debug)]
pub enum EventPublisherError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("send timed out after {0}ms")]
    Timeout(u64),
}

impl From<EventPublisherError> for SchedulingError {
    fn from(err: EventPublisherError) -> Self {
        match err {
            EventPublisherError::Broker(message) => SchedulingError::BrokerError(message),
            EventPublisherError::Timeout(ms) => SchedulingError::RpcTimeout(ms),
        }
    }
}
