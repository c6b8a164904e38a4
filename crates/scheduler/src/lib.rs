//! The stevedore scheduling engine.
//!
//! One scheduling round answers: given current cluster state, which
//! pending jobs launch on which nodes, and which running jobs make room.
//! The pieces, leaves first:
//!
//! - [`nodedb`]: indexed, snapshot-consistent node store with transactional
//!   overlays for tentative placement.
//! - [`constraints`]: per-round, per-queue, and per-priority admission caps.
//! - [`context`]: the per-round ledger of what happened and why.
//! - [`gang`]: all-or-nothing placement of one gang.
//! - [`queue_scheduler`]: the fair multi-queue round driver.
//! - [`preemption`]: the evict-and-rerun pass around the queue scheduler.
//! - [`reports`]: copy-on-write repository of recent rounds for queries.
//! - [`service`]: the periodic, leader-gated round loop wired to the ports.

pub mod config;
pub mod constraints;
pub mod context;
pub mod gang;
pub mod nodedb;
pub mod preemption;
pub mod queue_scheduler;
pub mod reports;
pub mod service;
pub mod testfixtures;

pub use config::{IndexedResource, PreemptionConfig, SchedulerConfiguration, SchedulingConfig};
pub use constraints::{SchedulingConstraints, UnschedulableReason};
pub use context::{
    EvictedJob, GangSchedulingContext, JobSchedulingContext, QueueSchedulingContext,
    SchedulingContext,
};
pub use gang::GangScheduler;
pub use nodedb::{
    FitFailure, NoFitSummary, NodeDb, NodeDbSnapshot, NodeDbTxn, NodeSelection, SelectionOutcome,
};
pub use preemption::{PreemptingQueueScheduler, PreemptionResult, RescheduledJob};
pub use queue_scheduler::{QueueScheduler, RoundControl};
pub use reports::SchedulingContextRepository;
pub use service::{RoundSummary, SchedulingService};
