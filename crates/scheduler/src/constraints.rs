//! Admission caps checked before and after each gang is placed.
//!
//! Round caps (resources newly scheduled this round, job/gang counts) are
//! checked against the totals *before* the gang under consideration: a gang
//! admitted while the total is still at or under the cap may overshoot it
//! once. Per-queue per-priority caps are checked against totals *including*
//! the gang, so an oversized gang blocks while a later smaller one may
//! still fit.

use std::collections::HashMap;
use std::fmt;

use stevedore_core::{Quantity, ResourceList};

use crate::config::SchedulingConfig;
use crate::context::SchedulingContext;

/// Why a gang (or the whole round) could not proceed. Machine-readable;
/// `Display` provides the report string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnschedulableReason {
    JobTooSmall {
        resource: String,
        minimum: Quantity,
    },
    RoundResourceCapExceeded {
        resource: String,
    },
    QueuePriorityCapExceeded {
        queue: String,
        priority: i32,
        resource: String,
    },
    MaximumJobsScheduled,
    MaximumGangsScheduled,
    /// At least one gang member fits on no node.
    NoNodeFits,
    DeadlineExceeded,
    Cancelled,
}

impl UnschedulableReason {
    /// Whether hitting this reason ends the whole round rather than just
    /// skipping the gang.
    pub fn is_round_terminal(&self) -> bool {
        matches!(
            self,
            UnschedulableReason::RoundResourceCapExceeded { .. }
                | UnschedulableReason::MaximumJobsScheduled
                | UnschedulableReason::MaximumGangsScheduled
                | UnschedulableReason::DeadlineExceeded
                | UnschedulableReason::Cancelled
        )
    }
}

impl fmt::Display for UnschedulableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnschedulableReason::JobTooSmall { resource, minimum } => {
                write!(f, "job requests less than the minimum {minimum} {resource}")
            }
            UnschedulableReason::RoundResourceCapExceeded { resource } => {
                write!(f, "maximum {resource} scheduled per round exceeded")
            }
            UnschedulableReason::QueuePriorityCapExceeded {
                queue,
                priority,
                resource,
            } => write!(
                f,
                "queue {queue} would exceed its {resource} cap at priority {priority}"
            ),
            UnschedulableReason::MaximumJobsScheduled => {
                write!(f, "maximum number of jobs scheduled this round")
            }
            UnschedulableReason::MaximumGangsScheduled => {
                write!(f, "maximum number of gangs scheduled this round")
            }
            UnschedulableReason::NoNodeFits => {
                write!(f, "at least one gang member fits on no node")
            }
            UnschedulableReason::DeadlineExceeded => write!(f, "scheduling deadline exceeded"),
            UnschedulableReason::Cancelled => write!(f, "scheduling round cancelled"),
        }
    }
}

/// The cap stack of one round, resolved for a pool.
#[derive(Debug, Clone)]
pub struct SchedulingConstraints {
    total_resources: ResourceList,
    minimum_job_size: ResourceList,
    /// Round cap, already resolved: the pool override when present, the
    /// global cap otherwise.
    round_cap: HashMap<String, f64>,
    /// Per-queue cumulative caps keyed by priority, assembled from the
    /// configured priority classes.
    queue_caps_by_priority: HashMap<i32, HashMap<String, f64>>,
    maximum_jobs_to_schedule: Option<usize>,
    maximum_gangs_to_schedule: Option<usize>,
}

impl SchedulingConstraints {
    pub fn from_config(
        pool: &str,
        total_resources: ResourceList,
        config: &SchedulingConfig,
    ) -> Self {
        let mut queue_caps_by_priority: HashMap<i32, HashMap<String, f64>> = HashMap::new();
        for class in config.preemption.priority_classes.values() {
            if !class.maximum_resource_fraction_per_queue.is_empty() {
                queue_caps_by_priority
                    .entry(class.priority)
                    .or_default()
                    .extend(class.maximum_resource_fraction_per_queue.clone());
            }
        }
        SchedulingConstraints {
            total_resources,
            minimum_job_size: config.minimum_job_size.clone(),
            round_cap: config.round_cap_for_pool(pool).clone(),
            queue_caps_by_priority,
            maximum_jobs_to_schedule: config.maximum_jobs_to_schedule,
            maximum_gangs_to_schedule: config.maximum_gangs_to_schedule,
        }
    }

    pub fn total_resources(&self) -> &ResourceList {
        &self.total_resources
    }

    /// Round-level checks, run before a gang of `gang_size` jobs is tried.
    pub fn check_round(
        &self,
        sctx: &SchedulingContext,
        gang_size: usize,
    ) -> Option<UnschedulableReason> {
        if let Some(max_jobs) = self.maximum_jobs_to_schedule {
            if sctx.num_scheduled_jobs + gang_size > max_jobs {
                return Some(UnschedulableReason::MaximumJobsScheduled);
            }
        }
        if let Some(max_gangs) = self.maximum_gangs_to_schedule {
            if sctx.num_scheduled_gangs + 1 > max_gangs {
                return Some(UnschedulableReason::MaximumGangsScheduled);
            }
        }
        let scheduled = sctx.scheduled_by_priority.total();
        for (resource, fraction) in &self.round_cap {
            let cap = self.total_resources.get(resource).scale(*fraction);
            if scheduled.get(resource) > cap {
                return Some(UnschedulableReason::RoundResourceCapExceeded {
                    resource: resource.clone(),
                });
            }
        }
        None
    }

    /// Minimum-size check for a single job's requests.
    pub fn check_job_size(&self, requests: &ResourceList) -> Option<UnschedulableReason> {
        for (resource, minimum) in self.minimum_job_size.iter() {
            if requests.get(resource) < minimum {
                return Some(UnschedulableReason::JobTooSmall {
                    resource: resource.to_string(),
                    minimum,
                });
            }
        }
        None
    }

    /// Per-queue cumulative cap at `priority`, checked against the queue's
    /// allocation *including* the gang under consideration.
    pub fn check_queue_caps(
        &self,
        queue: &str,
        priority: i32,
        prospective_allocated: &ResourceList,
    ) -> Option<UnschedulableReason> {
        let caps = self.queue_caps_by_priority.get(&priority)?;
        for (resource, fraction) in caps {
            let cap = self.total_resources.get(resource).scale(*fraction);
            if prospective_allocated.get(resource) > cap {
                return Some(UnschedulableReason::QueuePriorityCapExceeded {
                    queue: queue.to_string(),
                    priority,
                    resource: resource.clone(),
                });
            }
        }
        None
    }
}
