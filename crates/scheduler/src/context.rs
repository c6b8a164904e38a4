//! Per-round scheduling contexts: the ledger of what was attempted,
//! scheduled, and evicted, and why.
//!
//! Ownership is strictly one-way: the scheduling context owns queue
//! contexts by map, and job contexts name their queue by string. All
//! per-priority totals are maintained incrementally so constraint checks
//! are O(1). Contexts are mutated only by the round that created them,
//! then frozen and handed to the report repository.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use stevedore_core::{Job, JobId, ResourceList, ResourceListByPriority, SchedulingError};

use crate::constraints::UnschedulableReason;
use crate::nodedb::NoFitSummary;

/// The outcome of trying to place one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSchedulingContext {
    pub executor_id: String,
    pub created: DateTime<Utc>,
    pub job: Job,
    /// Priority resolved from the job's class.
    pub priority: i32,
    /// The chosen node, when placement succeeded.
    pub assigned_node: Option<String>,
    pub unschedulable_reason: Option<UnschedulableReason>,
    /// Per-candidate rejection reasons from the node DB.
    pub no_fit: Option<NoFitSummary>,
    /// Set when this job was evicted earlier in the round and found a place
    /// again.
    pub rescheduled_after_eviction: bool,
}

impl JobSchedulingContext {
    pub fn from_job(job: Job, executor_id: impl Into<String>, priority: i32) -> Self {
        JobSchedulingContext {
            executor_id: executor_id.into(),
            created: Utc::now(),
            job,
            priority,
            assigned_node: None,
            unschedulable_reason: None,
            no_fit: None,
            rescheduled_after_eviction: false,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    pub fn requests(&self) -> &ResourceList {
        &self.job.requests
    }

    pub fn is_successful(&self) -> bool {
        self.assigned_node.is_some()
    }
}

impl fmt::Display for JobSchedulingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "job {}:", self.job.id)?;
        writeln!(f, "\tqueue: {}", self.job.queue)?;
        writeln!(
            f,
            "\tpriority: {} ({})",
            self.priority, self.job.priority_class
        )?;
        writeln!(f, "\trequests: {}", self.job.requests)?;
        match &self.assigned_node {
            Some(node) => writeln!(f, "\tassigned node: {node}")?,
            None => {
                if let Some(reason) = &self.unschedulable_reason {
                    writeln!(f, "\tunschedulable: {reason}")?;
                }
                if let Some(no_fit) = &self.no_fit {
                    writeln!(f, "\tnode rejections: {no_fit}")?;
                }
            }
        }
        Ok(())
    }
}

/// The members of one gang moving through the gang scheduler together.
#[derive(Debug, Clone)]
pub struct GangSchedulingContext {
    pub queue: String,
    pub priority_class: String,
    pub priority: i32,
    pub preemptible: bool,
    pub total_requests: ResourceList,
    pub jctxs: Vec<JobSchedulingContext>,
}

impl GangSchedulingContext {
    /// Wrap member job contexts; members are kept in job-id order so
    /// placement is reproducible.
    pub fn new(
        mut jctxs: Vec<JobSchedulingContext>,
        preemptible: bool,
    ) -> Result<Self, SchedulingError> {
        let Some(first) = jctxs.first() else {
            return Err(SchedulingError::invalid_argument("gang", "empty gang"));
        };
        let queue = first.job.queue.clone();
        let priority_class = first.job.priority_class.clone();
        let priority = first.priority;
        for jctx in &jctxs {
            if jctx.job.queue != queue || jctx.job.priority_class != priority_class {
                return Err(SchedulingError::invalid_argument(
                    "gang",
                    format!(
                        "gang members must share queue and priority class; found {}/{} and {}/{}",
                        queue, priority_class, jctx.job.queue, jctx.job.priority_class
                    ),
                ));
            }
        }
        jctxs.sort_by(|a, b| a.job.id.cmp(&b.job.id));
        let mut total_requests = ResourceList::new();
        for jctx in &jctxs {
            total_requests.add(&jctx.job.requests);
        }
        Ok(GangSchedulingContext {
            queue,
            priority_class,
            priority,
            preemptible,
            total_requests,
            jctxs,
        })
    }

    pub fn len(&self) -> usize {
        self.jctxs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jctxs.is_empty()
    }
}

/// A job evicted during this round, with where it ran.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictedJob {
    pub job: Job,
    pub node_id: String,
    pub priority: i32,
    pub reason: String,
}

/// Per-queue slice of a round.
#[derive(Debug, Clone)]
pub struct QueueSchedulingContext {
    pub queue: String,
    pub executor_id: String,
    pub created: DateTime<Utc>,
    /// Smaller factor means a larger fair share.
    pub priority_factor: f64,
    /// Cumulative usage including jobs already running before the round.
    pub allocated_by_priority: ResourceListByPriority,
    /// Newly scheduled this round.
    pub scheduled_by_priority: ResourceListByPriority,
    /// Preempted this round (final, after re-scheduling).
    pub evicted_by_priority: ResourceListByPriority,
    pub successful_jobs: BTreeMap<JobId, JobSchedulingContext>,
    pub unsuccessful_jobs: BTreeMap<JobId, JobSchedulingContext>,
    pub evicted_jobs: BTreeMap<JobId, EvictedJob>,
}

impl QueueSchedulingContext {
    pub fn allocated_total(&self) -> ResourceList {
        self.allocated_by_priority.total()
    }
}

impl fmt::Display for QueueSchedulingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "queue {} (priority factor {}):",
            self.queue, self.priority_factor
        )?;
        writeln!(f, "\tallocated: {}", self.allocated_by_priority)?;
        writeln!(f, "\tscheduled this round: {}", self.scheduled_by_priority)?;
        writeln!(f, "\tevicted this round: {}", self.evicted_by_priority)?;
        writeln!(
            f,
            "\tjobs: {} scheduled, {} unschedulable, {} evicted",
            self.successful_jobs.len(),
            self.unsuccessful_jobs.len(),
            self.evicted_jobs.len()
        )?;
        Ok(())
    }
}

/// One round's ledger for one executor.
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    pub executor_id: String,
    pub pool: String,
    pub created: DateTime<Utc>,
    pub total_resources: ResourceList,
    pub queue_contexts: BTreeMap<String, QueueSchedulingContext>,
    pub scheduled_by_priority: ResourceListByPriority,
    pub evicted_by_priority: ResourceListByPriority,
    pub num_scheduled_jobs: usize,
    pub num_scheduled_gangs: usize,
    pub num_evicted_jobs: usize,
    /// Why the round stopped early, if it did.
    pub termination_reason: Option<UnschedulableReason>,
}

impl SchedulingContext {
    pub fn new(
        executor_id: impl Into<String>,
        pool: impl Into<String>,
        total_resources: ResourceList,
    ) -> Self {
        SchedulingContext {
            executor_id: executor_id.into(),
            pool: pool.into(),
            created: Utc::now(),
            total_resources,
            queue_contexts: BTreeMap::new(),
            scheduled_by_priority: ResourceListByPriority::new(),
            evicted_by_priority: ResourceListByPriority::new(),
            num_scheduled_jobs: 0,
            num_scheduled_gangs: 0,
            num_evicted_jobs: 0,
            termination_reason: None,
        }
    }

    /// Register a queue for this round with its fair-share factor and the
    /// usage it already holds.
    pub fn add_queue_scheduling_context(
        &mut self,
        queue: impl Into<String>,
        priority_factor: f64,
        allocated_by_priority: ResourceListByPriority,
    ) -> Result<(), SchedulingError> {
        let queue = queue.into();
        if queue.is_empty() {
            return Err(SchedulingError::invalid_argument("queue", "empty queue name"));
        }
        if self.queue_contexts.contains_key(&queue) {
            return Err(SchedulingError::invalid_argument(
                "queue",
                format!("queue {queue} already registered"),
            ));
        }
        self.queue_contexts.insert(
            queue.clone(),
            QueueSchedulingContext {
                queue,
                executor_id: self.executor_id.clone(),
                created: Utc::now(),
                priority_factor,
                allocated_by_priority,
                scheduled_by_priority: ResourceListByPriority::new(),
                evicted_by_priority: ResourceListByPriority::new(),
                successful_jobs: BTreeMap::new(),
                unsuccessful_jobs: BTreeMap::new(),
                evicted_jobs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn queue_context(&self, queue: &str) -> Option<&QueueSchedulingContext> {
        self.queue_contexts.get(queue)
    }

    /// Record a fully placed gang: totals, counts, and member contexts.
    pub fn add_gang_scheduling_context(
        &mut self,
        gctx: GangSchedulingContext,
    ) -> Result<(), SchedulingError> {
        let qctx = self.queue_contexts.get_mut(&gctx.queue).ok_or_else(|| {
            SchedulingError::invalid_argument("queue", format!("unknown queue {}", gctx.queue))
        })?;
        self.num_scheduled_gangs += 1;
        for jctx in gctx.jctxs {
            debug_assert!(jctx.is_successful());
            qctx.allocated_by_priority
                .add_at(jctx.priority, &jctx.job.requests);
            qctx.scheduled_by_priority
                .add_at(jctx.priority, &jctx.job.requests);
            self.scheduled_by_priority
                .add_at(jctx.priority, &jctx.job.requests);
            self.num_scheduled_jobs += 1;
            qctx.successful_jobs.insert(jctx.job.id, jctx);
        }
        Ok(())
    }

    /// Record a single failed job attempt.
    pub fn add_job_scheduling_context(
        &mut self,
        jctx: JobSchedulingContext,
    ) -> Result<(), SchedulingError> {
        let qctx = self.queue_contexts.get_mut(&jctx.job.queue).ok_or_else(|| {
            SchedulingError::invalid_argument("queue", format!("unknown queue {}", jctx.job.queue))
        })?;
        if jctx.is_successful() {
            return Err(SchedulingError::InvariantViolation(
                "successful jobs are recorded through their gang".to_string(),
            ));
        }
        qctx.unsuccessful_jobs.insert(jctx.job.id, jctx);
        Ok(())
    }

    /// Release a queue's claim on resources when one of its running jobs is
    /// unbound. Final preemption accounting happens in [`Self::evict_job`]
    /// only for jobs that do not find a place again.
    pub fn remove_allocation(&mut self, queue: &str, priority: i32, requests: &ResourceList) {
        if let Some(qctx) = self.queue_contexts.get_mut(queue) {
            qctx.allocated_by_priority.sub_at(priority, requests);
        }
    }

    /// Record a job as preempted.
    pub fn evict_job(&mut self, evicted: EvictedJob) -> Result<(), SchedulingError> {
        let qctx = self
            .queue_contexts
            .get_mut(&evicted.job.queue)
            .ok_or_else(|| {
                SchedulingError::invalid_argument(
                    "queue",
                    format!("unknown queue {}", evicted.job.queue),
                )
            })?;
        qctx.evicted_by_priority
            .add_at(evicted.priority, &evicted.job.requests);
        self.evicted_by_priority
            .add_at(evicted.priority, &evicted.job.requests);
        self.num_evicted_jobs += 1;
        qctx.evicted_jobs.insert(evicted.job.id, evicted);
        Ok(())
    }
}

impl fmt::Display for SchedulingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "executor {} (pool {}) at {}:",
            self.executor_id, self.pool, self.created
        )?;
        writeln!(f, "\ttotal resources: {}", self.total_resources)?;
        writeln!(f, "\tscheduled: {}", self.scheduled_by_priority)?;
        writeln!(f, "\tevicted: {}", self.evicted_by_priority)?;
        writeln!(
            f,
            "\tjobs: {} scheduled in {} gangs, {} evicted",
            self.num_scheduled_jobs, self.num_scheduled_gangs, self.num_evicted_jobs
        )?;
        if let Some(reason) = &self.termination_reason {
            writeln!(f, "\tround ended early: {reason}")?;
        }
        for qctx in self.queue_contexts.values() {
            write!(f, "{qctx}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfixtures::{cpu_job, cpu_resources, job_context};

    #[test]
    fn test_gang_context_rejects_mixed_queues() {
        let a = job_context(&cpu_job("queue-a", 0, 1), "executor-1");
        let b = job_context(&cpu_job("queue-b", 0, 1), "executor-1");
        assert!(GangSchedulingContext::new(vec![a, b], true).is_err());
        assert!(GangSchedulingContext::new(vec![], true).is_err());
    }

    #[test]
    fn test_gang_context_sorts_members_and_sums_requests() {
        let jobs: Vec<_> = (0..3).map(|_| cpu_job("queue-a", 0, 2)).collect();
        let jctxs: Vec<_> = jobs.iter().map(|j| job_context(j, "executor-1")).collect();
        let gctx = GangSchedulingContext::new(jctxs, true).unwrap();
        assert_eq!(gctx.total_requests, cpu_resources(6));
        for pair in gctx.jctxs.windows(2) {
            assert!(pair[0].job.id < pair[1].job.id);
        }
    }

    #[test]
    fn test_totals_track_scheduled_gangs() {
        let mut sctx = SchedulingContext::new("executor-1", "pool", cpu_resources(32));
        sctx.add_queue_scheduling_context("queue-a", 1.0, ResourceListByPriority::new())
            .unwrap();

        let jobs: Vec<_> = (0..2).map(|_| cpu_job("queue-a", 0, 3)).collect();
        let mut jctxs: Vec<_> = jobs.iter().map(|j| job_context(j, "executor-1")).collect();
        for jctx in &mut jctxs {
            jctx.assigned_node = Some("node-1".to_string());
        }
        let gctx = GangSchedulingContext::new(jctxs, true).unwrap();
        sctx.add_gang_scheduling_context(gctx).unwrap();

        assert_eq!(sctx.num_scheduled_jobs, 2);
        assert_eq!(sctx.num_scheduled_gangs, 1);
        assert_eq!(sctx.scheduled_by_priority.total(), cpu_resources(6));
        let qctx = sctx.queue_context("queue-a").unwrap();
        assert_eq!(qctx.allocated_total(), cpu_resources(6));
        assert_eq!(qctx.successful_jobs.len(), 2);
    }

    #[test]
    fn test_duplicate_queue_rejected() {
        let mut sctx = SchedulingContext::new("executor-1", "pool", cpu_resources(32));
        sctx.add_queue_scheduling_context("queue-a", 1.0, ResourceListByPriority::new())
            .unwrap();
        assert!(sctx
            .add_queue_scheduling_context("queue-a", 1.0, ResourceListByPriority::new())
            .is_err());
    }

    #[test]
    fn test_eviction_accounting() {
        let mut sctx = SchedulingContext::new("executor-1", "pool", cpu_resources(32));
        sctx.add_queue_scheduling_context("queue-a", 1.0, ResourceListByPriority::new())
            .unwrap();
        let job = cpu_job("queue-a", 0, 4);
        sctx.evict_job(EvictedJob {
            job: job.clone(),
            node_id: "node-1".to_string(),
            priority: 900,
            reason: "preempted by higher-priority work".to_string(),
        })
        .unwrap();
        assert_eq!(sctx.num_evicted_jobs, 1);
        assert_eq!(sctx.evicted_by_priority.get(900), cpu_resources(4));
        let qctx = sctx.queue_context("queue-a").unwrap();
        assert!(qctx.evicted_jobs.contains_key(&job.id));
    }
}
