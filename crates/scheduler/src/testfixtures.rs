//! Shared fixtures for scheduler tests: a standard priority-class setup,
//! 32-cpu style nodes, and small cpu-only jobs.

use std::collections::BTreeMap;

use chrono::Utc;
use stevedore_core::{
    GangDescriptor, Job, Node, PriorityClass, Quantity, ResourceList, RunningJob,
};
use ulid::Ulid;

use crate::config::{IndexedResource, SchedulingConfig};
use crate::context::{JobSchedulingContext, SchedulingContext};

/// Every priority configured by [`test_scheduling_config`].
pub const PRIORITIES: [i32; 6] = [0, 1, 2, 3, 900, 1000];

pub const DEFAULT_CLASS: &str = "stevedore-default";
pub const PREEMPTIBLE_CLASS: &str = "stevedore-preemptible";

/// Scheduling config used across tests: numbered preemptible classes 0-3,
/// the well-known default (1000, non-preemptible) and preemptible (900)
/// classes, cpu indexed at milli resolution, and enough extra candidates
/// per lookup that scoring is exercised.
pub fn test_scheduling_config() -> SchedulingConfig {
    let mut config = SchedulingConfig::default();
    for i in 0..4 {
        config
            .preemption
            .priority_classes
            .insert(format!("class-{i}"), PriorityClass::new(i, true));
    }
    config.indexed_resources = vec![IndexedResource {
        name: "cpu".to_string(),
        resolution: Quantity::from_millis(1),
    }];
    config.indexed_taints = vec!["gpu".to_string()];
    config.indexed_node_labels = vec!["zone".to_string()];
    config.max_extra_nodes_to_consider = 16;
    config
}

pub fn cpu_resources(units: i64) -> ResourceList {
    ResourceList::from_pairs([("cpu", Quantity::from_units(units))])
}

/// A node with `units` cpu on executor `cluster-1`.
pub fn cpu_node(id: &str, units: i64) -> Node {
    Node::new(id, "cluster-1", cpu_resources(units), &PRIORITIES)
}

/// `count` nodes named `node-0..count` with `units` cpu each.
pub fn cpu_nodes(count: usize, units: i64) -> Vec<Node> {
    (0..count).map(|i| cpu_node(&format!("node-{i}"), units)).collect()
}

/// A singleton job in `class-{class_index}` requesting `units` cpu.
pub fn cpu_job(queue: &str, class_index: usize, units: i64) -> Job {
    job_with_class(queue, &format!("class-{class_index}"), units)
}

pub fn job_with_class(queue: &str, priority_class: &str, units: i64) -> Job {
    Job {
        id: Ulid::new(),
        queue: queue.to_string(),
        job_set: format!("{queue}-set"),
        priority_class: priority_class.to_string(),
        requests: cpu_resources(units),
        tolerations: Vec::new(),
        node_selector: Default::default(),
        affinity: Default::default(),
        anti_affinity_labels: BTreeMap::new(),
        gang: None,
        submitted_at: Utc::now(),
    }
}

/// `count` one-cpu jobs forming one gang.
pub fn cpu_gang(queue: &str, priority_class: &str, count: usize) -> Vec<Job> {
    let gang_id = Ulid::new().to_string();
    (0..count)
        .map(|_| {
            let mut job = job_with_class(queue, priority_class, 1);
            job.gang = Some(GangDescriptor {
                id: gang_id.clone(),
                cardinality: count,
            });
            job
        })
        .collect()
}

/// A job context with the priority resolved through the test config.
pub fn job_context(job: &Job, executor_id: &str) -> JobSchedulingContext {
    let config = test_scheduling_config();
    let priority = config.priority_class(&job.priority_class).priority;
    JobSchedulingContext::from_job(job.clone(), executor_id, priority)
}

pub fn empty_scheduling_context(total_resources: ResourceList) -> SchedulingContext {
    SchedulingContext::new("executor-1", "pool", total_resources)
}

/// Bind `job` onto `node` directly, as if a previous round had placed it.
pub fn run_job_on_node(node: &mut Node, job: &Job, priority: i32, preemptible: bool) {
    for (layer_priority, layer) in node.allocatable_by_priority.iter_mut() {
        if *layer_priority <= priority {
            layer.saturating_sub(&job.requests);
        }
    }
    node.running_jobs.insert(
        job.id,
        RunningJob {
            job: job.clone(),
            priority,
            preemptible,
        },
    );
}
