//! Fair multi-queue round driver.
//!
//! Queues are served in order of dominant-resource share times priority
//! factor, smallest key first, ties broken by queue name. Each queue's
//! pending jobs are grouped into gangs lazily; a queue that accumulates
//! `max_queue_lookback` consecutive failed gangs is done for the round.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::time::Instant;

use stevedore_core::{Job, SchedulingError};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::SchedulingConfig;
use crate::constraints::{SchedulingConstraints, UnschedulableReason};
use crate::context::{GangSchedulingContext, JobSchedulingContext, SchedulingContext};
use crate::gang::GangScheduler;
use crate::nodedb::NodeDbTxn;

/// Cooperative controls of one round: a deadline and a cancellation signal,
/// both checked between gangs. A round that stops early keeps its partial
/// progress.
#[derive(Clone, Default)]
pub struct RoundControl {
    pub deadline: Option<Instant>,
    pub cancel: Option<watch::Receiver<bool>>,
}

impl RoundControl {
    pub fn with_deadline(deadline: Instant) -> Self {
        RoundControl {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    pub fn check(&self) -> Option<UnschedulableReason> {
        if let Some(cancel) = &self.cancel {
            if *cancel.borrow() {
                return Some(UnschedulableReason::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(UnschedulableReason::DeadlineExceeded);
            }
        }
        None
    }
}

/// Pulls a queue's jobs in submission order and groups them into gangs. A
/// gang is emitted once all `cardinality` members have been pulled;
/// singletons are emitted immediately.
struct QueuedGangIterator {
    jobs: VecDeque<Job>,
    partial_gangs: HashMap<String, Vec<Job>>,
}

impl QueuedGangIterator {
    fn new(mut jobs: Vec<Job>) -> Self {
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        QueuedGangIterator {
            jobs: jobs.into(),
            partial_gangs: HashMap::new(),
        }
    }

    fn next_gang(&mut self) -> Option<Vec<Job>> {
        while let Some(job) = self.jobs.pop_front() {
            match job.gang.clone() {
                None => return Some(vec![job]),
                Some(descriptor) => {
                    let members = self.partial_gangs.entry(descriptor.id.clone()).or_default();
                    members.push(job);
                    if members.len() >= descriptor.cardinality {
                        return self.partial_gangs.remove(&descriptor.id);
                    }
                }
            }
        }
        None
    }

    fn incomplete_gang_ids(&self) -> impl Iterator<Item = &str> {
        self.partial_gangs.keys().map(|k| k.as_str())
    }
}

/// Max-heap entry inverted so the least-served queue pops first.
struct HeapEntry {
    share: f64,
    queue: String,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smaller share (and, on ties, smaller name) must surface first
        // from std's max-heap, so the comparison is reversed.
        other
            .share
            .total_cmp(&self.share)
            .then_with(|| other.queue.cmp(&self.queue))
    }
}

pub struct QueueScheduler<'a> {
    constraints: &'a SchedulingConstraints,
    config: &'a SchedulingConfig,
}

impl<'a> QueueScheduler<'a> {
    pub fn new(constraints: &'a SchedulingConstraints, config: &'a SchedulingConfig) -> Self {
        QueueScheduler {
            constraints,
            config,
        }
    }

    /// Run one round over `jobs_by_queue`. Every queue must have been
    /// registered on `sctx` beforehand. The outcome is recorded entirely
    /// in `sctx`; partial progress survives early termination.
    pub fn schedule(
        &self,
        txn: &mut NodeDbTxn<'_>,
        sctx: &mut SchedulingContext,
        jobs_by_queue: BTreeMap<String, Vec<Job>>,
        control: &RoundControl,
    ) -> Result<(), SchedulingError> {
        let gang_scheduler = GangScheduler::new(self.constraints, self.config);

        let mut iterators: BTreeMap<String, QueuedGangIterator> = BTreeMap::new();
        for (queue, jobs) in jobs_by_queue {
            if sctx.queue_context(&queue).is_none() {
                return Err(SchedulingError::invalid_argument(
                    "queue",
                    format!("queue {queue} has jobs but no scheduling context"),
                ));
            }
            iterators.insert(queue, QueuedGangIterator::new(jobs));
        }

        let mut heap: BinaryHeap<HeapEntry> = iterators
            .keys()
            .map(|queue| HeapEntry {
                share: self.fair_share_key(sctx, queue),
                queue: queue.clone(),
            })
            .collect();
        let mut consecutive_failures: HashMap<String, usize> = HashMap::new();

        while let Some(entry) = heap.pop() {
            if let Some(reason) = control.check() {
                debug!(%reason, "round stopped early");
                sctx.termination_reason = Some(reason);
                break;
            }
            let Some(iterator) = iterators.get_mut(&entry.queue) else {
                continue;
            };
            // Queue drained for the round: drop it from rotation.
            let Some(members) = iterator.next_gang() else {
                continue;
            };
            let gctx = match self.gang_context(sctx, members) {
                Ok(gctx) => gctx,
                // A malformed gang is dropped, not allowed to end the round.
                Err(err) => {
                    warn!(queue = %entry.queue, %err, "skipping invalid gang");
                    heap.push(HeapEntry {
                        share: self.fair_share_key(sctx, &entry.queue),
                        queue: entry.queue,
                    });
                    continue;
                }
            };
            match gang_scheduler.schedule(txn, sctx, gctx)? {
                None => {
                    consecutive_failures.insert(entry.queue.clone(), 0);
                }
                Some(reason) if reason.is_round_terminal() => {
                    sctx.termination_reason = Some(reason);
                    break;
                }
                Some(_) => {
                    let failures = consecutive_failures.entry(entry.queue.clone()).or_insert(0);
                    *failures += 1;
                    if *failures >= self.config.max_queue_lookback {
                        debug!(queue = %entry.queue, "lookback exhausted for this round");
                        continue;
                    }
                }
            }
            heap.push(HeapEntry {
                share: self.fair_share_key(sctx, &entry.queue),
                queue: entry.queue,
            });
        }

        for (queue, iterator) in &iterators {
            for gang_id in iterator.incomplete_gang_ids() {
                warn!(%queue, %gang_id, "gang missing members at end of round");
            }
        }
        Ok(())
    }

    fn fair_share_key(&self, sctx: &SchedulingContext, queue: &str) -> f64 {
        let Some(qctx) = sctx.queue_context(queue) else {
            return f64::MAX;
        };
        qctx.allocated_total().dominant_share(&sctx.total_resources) * qctx.priority_factor
    }

    fn gang_context(
        &self,
        sctx: &SchedulingContext,
        members: Vec<Job>,
    ) -> Result<GangSchedulingContext, SchedulingError> {
        let jctxs: Vec<JobSchedulingContext> = members
            .into_iter()
            .map(|mut job| {
                for (resource, quantity) in self.config.default_job_limits.iter() {
                    if !job.requests.contains(resource) {
                        job.requests.set(resource, quantity);
                    }
                }
                let priority = self.config.priority_class(&job.priority_class).priority;
                JobSchedulingContext::from_job(job, sctx.executor_id.clone(), priority)
            })
            .collect();
        let preemptible = jctxs
            .first()
            .map(|jctx| {
                self.config
                    .priority_class(&jctx.job.priority_class)
                    .preemptible
            })
            .unwrap_or(false);
        GangSchedulingContext::new(jctxs, preemptible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodedb::NodeDb;
    use crate::testfixtures::{cpu_gang, cpu_job, cpu_node, test_scheduling_config};
    use stevedore_core::ResourceListByPriority;

    struct Harness {
        config: SchedulingConfig,
        db: NodeDb,
        sctx: SchedulingContext,
    }

    impl Harness {
        fn new(node_units: i64) -> Self {
            Self::with_config(node_units, test_scheduling_config())
        }

        fn with_config(node_units: i64, config: SchedulingConfig) -> Self {
            let db = NodeDb::new(&config);
            db.upsert(cpu_node("node-0", node_units)).unwrap();
            let sctx = SchedulingContext::new("executor-1", "pool", db.total_resources());
            Harness { config, db, sctx }
        }

        fn register_queue(&mut self, queue: &str, priority_factor: f64) {
            self.sctx
                .add_queue_scheduling_context(queue, priority_factor, ResourceListByPriority::new())
                .unwrap();
        }

        fn run(&mut self, jobs_by_queue: BTreeMap<String, Vec<Job>>, control: &RoundControl) {
            let constraints = SchedulingConstraints::from_config(
                "pool",
                self.db.total_resources(),
                &self.config,
            );
            let scheduler = QueueScheduler::new(&constraints, &self.config);
            let mut txn = self.db.txn();
            scheduler
                .schedule(&mut txn, &mut self.sctx, jobs_by_queue, control)
                .unwrap();
            txn.commit().unwrap();
        }

        fn scheduled_count(&self, queue: &str) -> usize {
            self.sctx
                .queue_context(queue)
                .map(|q| q.successful_jobs.len())
                .unwrap_or(0)
        }
    }

    use stevedore_core::Job;

    fn jobs_map(entries: Vec<(&str, Vec<Job>)>) -> BTreeMap<String, Vec<Job>> {
        entries
            .into_iter()
            .map(|(q, jobs)| (q.to_string(), jobs))
            .collect()
    }

    #[test]
    fn test_equal_queues_split_capacity() {
        let mut harness = Harness::new(4);
        harness.register_queue("queue-a", 1.0);
        harness.register_queue("queue-b", 1.0);
        let jobs = jobs_map(vec![
            ("queue-a", (0..4).map(|_| cpu_job("queue-a", 0, 1)).collect()),
            ("queue-b", (0..4).map(|_| cpu_job("queue-b", 0, 1)).collect()),
        ]);
        harness.run(jobs, &RoundControl::default());
        assert_eq!(harness.scheduled_count("queue-a"), 2);
        assert_eq!(harness.scheduled_count("queue-b"), 2);
    }

    #[test]
    fn test_priority_factor_skews_share() {
        let mut harness = Harness::new(4);
        harness.register_queue("queue-a", 0.5);
        harness.register_queue("queue-b", 1.0);
        let jobs = jobs_map(vec![
            ("queue-a", (0..4).map(|_| cpu_job("queue-a", 0, 1)).collect()),
            ("queue-b", (0..4).map(|_| cpu_job("queue-b", 0, 1)).collect()),
        ]);
        harness.run(jobs, &RoundControl::default());
        assert_eq!(harness.scheduled_count("queue-a"), 3);
        assert_eq!(harness.scheduled_count("queue-b"), 1);
    }

    #[test]
    fn test_round_cap_stops_all_queues() {
        let mut config = test_scheduling_config();
        config
            .maximum_resource_fraction_to_schedule
            .insert("cpu".to_string(), 2.0 / 32.0);
        let mut harness = Harness::with_config(32, config);
        harness.register_queue("queue-a", 1.0);
        harness.register_queue("queue-b", 1.0);
        let jobs = jobs_map(vec![
            ("queue-a", (0..8).map(|_| cpu_job("queue-a", 0, 1)).collect()),
            ("queue-b", (0..8).map(|_| cpu_job("queue-b", 0, 1)).collect()),
        ]);
        harness.run(jobs, &RoundControl::default());
        // 1 from each queue admits at the cap, the third gang overshoots
        // and ends the round for everyone.
        let total = harness.scheduled_count("queue-a") + harness.scheduled_count("queue-b");
        assert_eq!(total, 3);
        assert!(matches!(
            harness.sctx.termination_reason,
            Some(UnschedulableReason::RoundResourceCapExceeded { .. })
        ));
    }

    #[test]
    fn test_lookback_bounds_failing_queue() {
        let mut config = test_scheduling_config();
        config.max_queue_lookback = 2;
        let mut harness = Harness::with_config(4, config);
        harness.register_queue("queue-a", 1.0);
        harness.register_queue("queue-b", 1.0);
        // queue-a's jobs are all too large; queue-b's fit.
        let jobs = jobs_map(vec![
            ("queue-a", (0..5).map(|_| cpu_job("queue-a", 0, 64)).collect()),
            ("queue-b", (0..3).map(|_| cpu_job("queue-b", 0, 1)).collect()),
        ]);
        harness.run(jobs, &RoundControl::default());
        assert_eq!(harness.scheduled_count("queue-b"), 3);
        let qctx = harness.sctx.queue_context("queue-a").unwrap();
        // Only the lookback budget of queue-a jobs was examined.
        assert_eq!(qctx.unsuccessful_jobs.len(), 2);
    }

    #[test]
    fn test_gangs_group_across_queue_order() {
        let mut harness = Harness::new(32);
        harness.register_queue("queue-a", 1.0);
        let mut jobs = cpu_gang("queue-a", "class-0", 3);
        jobs.push(cpu_job("queue-a", 0, 1));
        let jobs = jobs_map(vec![("queue-a", jobs)]);
        harness.run(jobs, &RoundControl::default());
        assert_eq!(harness.scheduled_count("queue-a"), 4);
        assert_eq!(harness.sctx.num_scheduled_gangs, 2);
    }

    #[test]
    fn test_expired_deadline_reports_partial_progress() {
        let mut harness = Harness::new(32);
        harness.register_queue("queue-a", 1.0);
        let jobs = jobs_map(vec![(
            "queue-a",
            (0..4).map(|_| cpu_job("queue-a", 0, 1)).collect(),
        )]);
        let control = RoundControl::with_deadline(Instant::now() - std::time::Duration::from_millis(1));
        harness.run(jobs, &control);
        assert_eq!(harness.scheduled_count("queue-a"), 0);
        assert_eq!(
            harness.sctx.termination_reason,
            Some(UnschedulableReason::DeadlineExceeded)
        );
    }

    #[test]
    fn test_cancellation_between_gangs() {
        let mut harness = Harness::new(32);
        harness.register_queue("queue-a", 1.0);
        let (tx, rx) = watch::channel(true);
        let control = RoundControl {
            deadline: None,
            cancel: Some(rx),
        };
        let jobs = jobs_map(vec![(
            "queue-a",
            (0..4).map(|_| cpu_job("queue-a", 0, 1)).collect(),
        )]);
        harness.run(jobs, &control);
        drop(tx);
        assert_eq!(harness.scheduled_count("queue-a"), 0);
        assert_eq!(
            harness.sctx.termination_reason,
            Some(UnschedulableReason::Cancelled)
        );
    }

    #[test]
    fn test_no_jobs_is_a_no_op() {
        let mut harness = Harness::new(32);
        harness.register_queue("queue-a", 1.0);
        harness.run(BTreeMap::new(), &RoundControl::default());
        assert_eq!(harness.sctx.num_scheduled_jobs, 0);
        assert!(harness.sctx.scheduled_by_priority.is_zero());
        assert!(harness.sctx.termination_reason.is_none());
    }
}
