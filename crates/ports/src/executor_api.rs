//! Executor Lease API
//!
//! Executors pull work: each cluster agent periodically calls in with its
//! current nodes and the run ids it no longer recognizes, and receives the
//! leases, cancellations, and preemptions the last round produced for it.
//! The scheduler holds no connection to executors; an executor that stops
//! calling is timed out and its nodes purged from the node DB.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stevedore_core::{JobId, Node, ResourceList};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub executor_id: String,
    pub pool: String,
    pub available_capacity: ResourceList,
    pub nodes: Vec<Node>,
    /// Runs the executor reports but the scheduler never assigned to it.
    pub unassigned_run_ids: Vec<Uuid>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunLease {
    pub job_id: JobId,
    pub run_id: Uuid,
    pub queue: String,
    pub job_set: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub leased: Vec<JobRunLease>,
    pub to_cancel: Vec<Uuid>,
    pub to_preempt: Vec<Uuid>,
}
