//! Evict-and-rerun preemption.
//!
//! Before the main pass, preemptible work is evicted from a random subset
//! of nodes (oversubscribed nodes get their own, typically higher,
//! probability) and thrown back into the pool. The queue scheduler then
//! runs over new and evicted jobs together, so higher-priority demand can
//! claim the freed capacity while evicted jobs compete to keep their
//! place. Only jobs that end the round neither on their original node nor
//! re-scheduled are preempted for real.
//!
//! Gangs are evicted atomically: if one member goes, every member goes,
//! across nodes, before any unbind is committed.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::Rng;
use stevedore_core::{
    GangDescriptor, Job, JobId, ResourceList, ResourceListByPriority, SchedulingError,
};
use tracing::{debug, info};

use crate::config::SchedulingConfig;
use crate::constraints::SchedulingConstraints;
use crate::context::{EvictedJob, SchedulingContext};
use crate::nodedb::NodeDbTxn;
use crate::queue_scheduler::{QueueScheduler, RoundControl};

/// An evicted job that found a place again within the same round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduledJob {
    pub job_id: JobId,
    pub queue: String,
    pub original_node: String,
    pub new_node: String,
}

/// What the preempting pass did, beyond what the contexts record.
#[derive(Debug, Default)]
pub struct PreemptionResult {
    /// Jobs preempted for real: evicted and not re-scheduled.
    pub preempted: Vec<EvictedJob>,
    /// Evicted jobs that were placed again, possibly on another node.
    pub rescheduled: Vec<RescheduledJob>,
}

/// Queue scheduler wrapped in an eviction pass.
pub struct PreemptingQueueScheduler<'a> {
    constraints: &'a SchedulingConstraints,
    config: &'a SchedulingConfig,
}

impl<'a> PreemptingQueueScheduler<'a> {
    pub fn new(constraints: &'a SchedulingConstraints, config: &'a SchedulingConfig) -> Self {
        PreemptingQueueScheduler {
            constraints,
            config,
        }
    }

    /// Run one full round: eviction (when enabled), then scheduling over
    /// pending and evicted jobs together, then final preemption accounting.
    pub fn schedule(
        &self,
        txn: &mut NodeDbTxn<'_>,
        sctx: &mut SchedulingContext,
        mut jobs_by_queue: BTreeMap<String, Vec<Job>>,
        control: &RoundControl,
        rng: &mut StdRng,
    ) -> Result<PreemptionResult, SchedulingError> {
        let evicted = if self.config.preemption.enabled {
            self.evict(txn, sctx, rng)?
        } else {
            Vec::new()
        };
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted jobs ahead of the main pass");
        }

        // Evicted jobs re-enter the queue scheduler alongside new work.
        // Their ULIDs predate the pending jobs', so submission order puts
        // them first. A gang's descriptor is resized to the members still
        // running, so the candidate iterator emits it whole.
        let mut members_by_gang: HashMap<String, usize> = HashMap::new();
        for evicted_job in &evicted {
            if let Some(gang_id) = evicted_job.job.gang_id() {
                *members_by_gang.entry(gang_id.to_string()).or_default() += 1;
            }
        }
        for evicted_job in &evicted {
            let mut job = evicted_job.job.clone();
            if let Some(descriptor) = &job.gang {
                job.gang = Some(GangDescriptor {
                    id: descriptor.id.clone(),
                    cardinality: members_by_gang[&descriptor.id],
                });
            }
            jobs_by_queue.entry(job.queue.clone()).or_default().push(job);
        }

        QueueScheduler::new(self.constraints, self.config)
            .schedule(txn, sctx, jobs_by_queue, control)?;

        let mut result = PreemptionResult::default();
        for evicted_job in evicted {
            let queue = evicted_job.job.queue.clone();
            let rescheduled_to = sctx
                .queue_contexts
                .get_mut(&queue)
                .and_then(|qctx| qctx.successful_jobs.get_mut(&evicted_job.job.id))
                .map(|jctx| {
                    jctx.rescheduled_after_eviction = true;
                    jctx.assigned_node.clone().unwrap_or_default()
                });
            match rescheduled_to {
                Some(new_node) => result.rescheduled.push(RescheduledJob {
                    job_id: evicted_job.job.id,
                    queue,
                    original_node: evicted_job.node_id.clone(),
                    new_node,
                }),
                None => {
                    sctx.evict_job(evicted_job.clone())?;
                    result.preempted.push(evicted_job);
                }
            }
        }
        Ok(result)
    }

    /// The eviction pass. Victims are chosen per node in ascending priority
    /// among preemptible jobs; the round-level eviction cap bounds the
    /// total, except that resolving oversubscription and completing gangs
    /// take precedence over the cap.
    fn evict(
        &self,
        txn: &mut NodeDbTxn<'_>,
        sctx: &mut SchedulingContext,
        rng: &mut StdRng,
    ) -> Result<Vec<EvictedJob>, SchedulingError> {
        let preemption = &self.config.preemption;
        let cap = self
            .constraints
            .total_resources()
            .scale(preemption.maximum_eviction_fraction);

        let mut victims: Vec<(String, JobId)> = Vec::new();
        let mut victim_ids: HashSet<JobId> = HashSet::new();
        let mut victim_gangs: HashSet<String> = HashSet::new();
        let mut evicted_total = ResourceList::new();
        let mut cap_reached = false;

        let nodes: Vec<_> = txn.iter_nodes().cloned().collect();
        for node in &nodes {
            let node_id = &node.id;
            let oversubscribed = node.is_oversubscribed();
            if !oversubscribed && cap_reached {
                continue;
            }
            let probability = if oversubscribed {
                preemption.node_oversubscription_eviction_probability
            } else {
                preemption.node_eviction_probability
            };
            if probability <= 0.0 || !rng.gen_bool(probability.min(1.0)) {
                continue;
            }

            let mut bound = ResourceList::new();
            for running in node.running_jobs.values() {
                bound.add(running.requests());
            }
            let mut running: Vec<_> = node.running_jobs.iter().collect();
            running.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then(a.0.cmp(b.0)));

            for (job_id, running_job) in running {
                if !running_job.preemptible {
                    continue;
                }
                if oversubscribed {
                    if bound.fits_within(&node.total_resources) {
                        break;
                    }
                } else {
                    let mut prospective = evicted_total.clone();
                    prospective.add(running_job.requests());
                    if !prospective.fits_within(&cap) {
                        cap_reached = true;
                        debug!(node = %node_id, "eviction cap reached");
                        break;
                    }
                }
                evicted_total.add(running_job.requests());
                bound.saturating_sub(running_job.requests());
                victims.push((node_id.clone(), *job_id));
                victim_ids.insert(*job_id);
                if let Some(gang_id) = running_job.gang_id() {
                    victim_gangs.insert(gang_id.to_string());
                }
            }
        }

        // Gang closure: every member of a touched gang is evicted, on
        // whatever node it runs, before anything is committed.
        for node in &nodes {
            for (job_id, running_job) in &node.running_jobs {
                if victim_ids.contains(job_id) {
                    continue;
                }
                let in_touched_gang = running_job
                    .gang_id()
                    .is_some_and(|gang_id| victim_gangs.contains(gang_id));
                if in_touched_gang {
                    victims.push((node.id.clone(), *job_id));
                    victim_ids.insert(*job_id);
                }
            }
        }

        let mut evicted = Vec::with_capacity(victims.len());
        for (node_id, job_id) in victims {
            let released = txn.unbind_job(&node_id, job_id)?;
            if sctx.queue_context(&released.job.queue).is_none() {
                sctx.add_queue_scheduling_context(
                    released.job.queue.clone(),
                    1.0,
                    ResourceListByPriority::new(),
                )?;
            }
            sctx.remove_allocation(&released.job.queue, released.priority, released.requests());
            evicted.push(EvictedJob {
                job: released.job,
                node_id,
                priority: released.priority,
                reason: "preempted by higher-priority work".to_string(),
            });
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodedb::NodeDb;
    use crate::testfixtures::{
        cpu_gang, cpu_node, cpu_resources, job_with_class, run_job_on_node,
        test_scheduling_config, DEFAULT_CLASS, PREEMPTIBLE_CLASS,
    };
    use rand::SeedableRng;
    use stevedore_core::Node;

    struct Harness {
        config: SchedulingConfig,
        db: NodeDb,
        sctx: SchedulingContext,
    }

    impl Harness {
        fn new(nodes: Vec<Node>, mut config: SchedulingConfig) -> Self {
            config.preemption.enabled = true;
            let db = NodeDb::new(&config);
            db.upsert_many(nodes).unwrap();
            let sctx = SchedulingContext::new("executor-1", "pool", db.total_resources());
            Harness { config, db, sctx }
        }

        fn register_queue(&mut self, queue: &str, allocated: ResourceListByPriority) {
            self.sctx
                .add_queue_scheduling_context(queue, 1.0, allocated)
                .unwrap();
        }

        fn run(&mut self, jobs_by_queue: BTreeMap<String, Vec<Job>>) -> PreemptionResult {
            let constraints = SchedulingConstraints::from_config(
                "pool",
                self.db.total_resources(),
                &self.config,
            );
            let scheduler = PreemptingQueueScheduler::new(&constraints, &self.config);
            let mut txn = self.db.txn();
            let mut rng = StdRng::seed_from_u64(7);
            let result = scheduler
                .schedule(
                    &mut txn,
                    &mut self.sctx,
                    jobs_by_queue,
                    &RoundControl::default(),
                    &mut rng,
                )
                .unwrap();
            txn.commit().unwrap();
            result
        }
    }

    fn packed_node(units: i64, queue: &str) -> (Node, ResourceListByPriority) {
        let mut node = cpu_node("node-0", units);
        let mut allocated = ResourceListByPriority::new();
        for _ in 0..units {
            let job = job_with_class(queue, PREEMPTIBLE_CLASS, 1);
            run_job_on_node(&mut node, &job, 900, true);
            allocated.add_at(900, &cpu_resources(1));
        }
        (node, allocated)
    }

    #[test]
    fn test_nonpreemptible_gang_displaces_preemptible_work() {
        let (node, allocated) = packed_node(32, "queue-b");
        let mut harness = Harness::new(vec![node], test_scheduling_config());
        harness.register_queue("queue-a", ResourceListByPriority::new());
        harness.register_queue("queue-b", allocated);

        let gang = cpu_gang("queue-a", DEFAULT_CLASS, 32);
        let result = harness.run(BTreeMap::from([("queue-a".to_string(), gang)]));

        assert_eq!(result.preempted.len(), 32);
        assert!(result.rescheduled.is_empty());
        assert_eq!(harness.sctx.evicted_by_priority.get(900), cpu_resources(32));
        assert_eq!(
            harness.sctx.scheduled_by_priority.get(1000),
            cpu_resources(32)
        );
        // The gang owns the node now.
        let node = harness.db.get_node("node-0").unwrap();
        assert_eq!(node.running_jobs.len(), 32);
        assert!(node.running_jobs.values().all(|r| r.priority == 1000));
    }

    #[test]
    fn test_evicted_jobs_reschedule_when_room_remains() {
        let mut node = cpu_node("node-0", 32);
        let mut allocated = ResourceListByPriority::new();
        for _ in 0..16 {
            let job = job_with_class("queue-b", PREEMPTIBLE_CLASS, 1);
            run_job_on_node(&mut node, &job, 900, true);
            allocated.add_at(900, &cpu_resources(1));
        }
        let mut harness = Harness::new(vec![node], test_scheduling_config());
        harness.register_queue("queue-a", ResourceListByPriority::new());
        harness.register_queue("queue-b", allocated);

        let job = job_with_class("queue-a", DEFAULT_CLASS, 8);
        let result = harness.run(BTreeMap::from([("queue-a".to_string(), vec![job])]));

        // Everything fits: the evicted jobs all find a place again.
        assert!(result.preempted.is_empty());
        assert_eq!(result.rescheduled.len(), 16);
        assert!(harness.sctx.evicted_by_priority.is_zero());
        let qctx = harness.sctx.queue_context("queue-b").unwrap();
        assert!(qctx
            .successful_jobs
            .values()
            .all(|jctx| jctx.rescheduled_after_eviction));
    }

    #[test]
    fn test_nonpreemptible_jobs_are_never_evicted() {
        let mut node = cpu_node("node-0", 32);
        let mut allocated = ResourceListByPriority::new();
        for _ in 0..32 {
            let job = job_with_class("queue-b", DEFAULT_CLASS, 1);
            run_job_on_node(&mut node, &job, 1000, false);
            allocated.add_at(1000, &cpu_resources(1));
        }
        let mut harness = Harness::new(vec![node], test_scheduling_config());
        harness.register_queue("queue-a", ResourceListByPriority::new());
        harness.register_queue("queue-b", allocated);

        let job = job_with_class("queue-a", DEFAULT_CLASS, 1);
        let result = harness.run(BTreeMap::from([("queue-a".to_string(), vec![job])]));

        assert!(result.preempted.is_empty());
        assert!(harness.sctx.evicted_by_priority.is_zero());
        let qctx = harness.sctx.queue_context("queue-a").unwrap();
        assert_eq!(qctx.unsuccessful_jobs.len(), 1);
        assert_eq!(harness.db.get_node("node-0").unwrap().running_jobs.len(), 32);
    }

    #[test]
    fn test_eviction_cap_bounds_the_pass() {
        let (node, allocated) = packed_node(16, "queue-b");
        let mut config = test_scheduling_config();
        config.preemption.maximum_eviction_fraction = 0.25;
        let mut harness = Harness::new(vec![node], config);
        harness.register_queue("queue-b", allocated);

        let result = harness.run(BTreeMap::new());

        // Total is 16 cpu, so at most 4 cpu of evictions; with nothing
        // competing they all reschedule.
        assert!(result.preempted.is_empty());
        assert_eq!(result.rescheduled.len(), 4);
    }

    #[test]
    fn test_oversubscribed_node_evicts_until_resolved() {
        let mut node = cpu_node("node-0", 2);
        let mut allocated = ResourceListByPriority::new();
        for _ in 0..3 {
            let job = job_with_class("queue-b", PREEMPTIBLE_CLASS, 1);
            run_job_on_node(&mut node, &job, 900, true);
            allocated.add_at(900, &cpu_resources(1));
        }
        let mut config = test_scheduling_config();
        // Only the oversubscription path may evict.
        config.preemption.node_eviction_probability = 0.0;
        config.preemption.node_oversubscription_eviction_probability = 1.0;
        let mut harness = Harness::new(vec![node], config);
        harness.register_queue("queue-b", allocated);

        let result = harness.run(BTreeMap::new());

        // One eviction resolves the overflow; the node is full, so the
        // evicted job stays preempted.
        assert_eq!(result.preempted.len(), 1);
        assert_eq!(harness.db.get_node("node-0").unwrap().running_jobs.len(), 2);
        assert!(!harness.db.get_node("node-0").unwrap().is_oversubscribed());
    }

    #[test]
    fn test_gang_members_evicted_together_across_nodes() {
        let gang = cpu_gang("queue-b", PREEMPTIBLE_CLASS, 2);
        let mut node_a = cpu_node("node-0", 4);
        let mut node_b = cpu_node("node-1", 4);
        run_job_on_node(&mut node_a, &gang[0], 900, true);
        run_job_on_node(&mut node_b, &gang[1], 900, true);
        let mut allocated = ResourceListByPriority::new();
        allocated.add_at(900, &cpu_resources(2));

        let mut config = test_scheduling_config();
        // The cap admits only the first member; gang closure must still
        // pull in the second.
        config.preemption.maximum_eviction_fraction = 1.0 / 8.0;
        let mut harness = Harness::new(vec![node_a, node_b], config);
        harness.register_queue("queue-b", allocated);

        let result = harness.run(BTreeMap::new());

        let evicted_or_back: usize = result.preempted.len() + result.rescheduled.len();
        assert_eq!(evicted_or_back, 2, "both gang members must be evicted");
        // With no competing demand the gang reschedules atomically.
        assert_eq!(result.rescheduled.len(), 2);
    }

    #[test]
    fn test_disabled_preemption_is_a_plain_round() {
        let (node, allocated) = packed_node(32, "queue-b");
        let mut config = test_scheduling_config();
        config.preemption.enabled = false;
        let db = NodeDb::new(&config);
        db.upsert(node).unwrap();
        let mut sctx = SchedulingContext::new("executor-1", "pool", db.total_resources());
        sctx.add_queue_scheduling_context("queue-b", 1.0, allocated)
            .unwrap();

        let constraints =
            SchedulingConstraints::from_config("pool", db.total_resources(), &config);
        let scheduler = PreemptingQueueScheduler::new(&constraints, &config);
        let mut txn = db.txn();
        let mut rng = StdRng::seed_from_u64(7);
        let result = scheduler
            .schedule(
                &mut txn,
                &mut sctx,
                BTreeMap::new(),
                &RoundControl::default(),
                &mut rng,
            )
            .unwrap();
        txn.commit().unwrap();

        assert!(result.preempted.is_empty());
        assert!(result.rescheduled.is_empty());
        assert!(sctx.evicted_by_priority.is_zero());
        assert_eq!(db.get_node("node-0").unwrap().running_jobs.len(), 32);
    }
}
