//! Copy-on-write store of recent scheduling contexts.
//!
//! On every add, each published map is cloned, mutated, and swapped behind
//! an atomic pointer, so readers never lock and never see a torn write. A
//! single mutex serializes writers. Job contexts are published first, then
//! queue contexts, then the scheduling context itself: a reader holding a
//! scheduling context can always resolve the children it refers to.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use arc_swap::ArcSwap;
use lru::LruCache;
use parking_lot::Mutex;
use stevedore_core::{JobId, SchedulingError};

use crate::context::{JobSchedulingContext, QueueSchedulingContext, SchedulingContext};

type ContextByExecutor = HashMap<String, Arc<SchedulingContext>>;
type QueueContextByExecutor = HashMap<String, Arc<QueueSchedulingContext>>;
type JobContextByExecutor = HashMap<String, Arc<JobSchedulingContext>>;

pub struct SchedulingContextRepository {
    // The most recent round per executor, plus the derived views: most
    // recent round that scheduled anything, most recent that preempted
    // anything.
    most_recent: ArcSwap<ContextByExecutor>,
    most_recent_successful: ArcSwap<ContextByExecutor>,
    most_recent_preempting: ArcSwap<ContextByExecutor>,

    most_recent_by_queue: ArcSwap<HashMap<String, QueueContextByExecutor>>,
    most_recent_successful_by_queue: ArcSwap<HashMap<String, QueueContextByExecutor>>,
    most_recent_preempting_by_queue: ArcSwap<HashMap<String, QueueContextByExecutor>>,

    /// Bounded cache of per-job contexts; size caps memory, not precision.
    job_contexts: Mutex<LruCache<JobId, JobContextByExecutor>>,

    executor_ids: Mutex<BTreeSet<String>>,
    sorted_executor_ids: ArcSwap<Vec<String>>,

    write_lock: Mutex<()>,
}

impl SchedulingContextRepository {
    pub fn new(max_job_scheduling_contexts: usize) -> Result<Self, SchedulingError> {
        let capacity = NonZeroUsize::new(max_job_scheduling_contexts).ok_or_else(|| {
            SchedulingError::invalid_argument(
                "max_job_scheduling_contexts",
                "must be positive",
            )
        })?;
        Ok(SchedulingContextRepository {
            most_recent: ArcSwap::from_pointee(HashMap::new()),
            most_recent_successful: ArcSwap::from_pointee(HashMap::new()),
            most_recent_preempting: ArcSwap::from_pointee(HashMap::new()),
            most_recent_by_queue: ArcSwap::from_pointee(HashMap::new()),
            most_recent_successful_by_queue: ArcSwap::from_pointee(HashMap::new()),
            most_recent_preempting_by_queue: ArcSwap::from_pointee(HashMap::new()),
            job_contexts: Mutex::new(LruCache::new(capacity)),
            executor_ids: Mutex::new(BTreeSet::new()),
            sorted_executor_ids: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        })
    }

    /// Store a frozen round. The context must not be mutated afterwards.
    pub fn add_scheduling_context(
        &self,
        sctx: Arc<SchedulingContext>,
    ) -> Result<(), SchedulingError> {
        if sctx.executor_id.is_empty() {
            return Err(SchedulingError::invalid_argument(
                "executor_id",
                "empty executor id",
            ));
        }
        let _guard = self.write_lock.lock();

        // Children first: job contexts, then queue contexts, then the
        // round itself.
        self.add_job_contexts(&sctx);
        self.add_queue_contexts(&sctx)?;

        let executor_id = sctx.executor_id.clone();
        swap_in(&self.most_recent, &executor_id, Some(sctx.clone()));
        swap_in(
            &self.most_recent_successful,
            &executor_id,
            (!sctx.scheduled_by_priority.is_zero()).then(|| sctx.clone()),
        );
        swap_in(
            &self.most_recent_preempting,
            &executor_id,
            (!sctx.evicted_by_priority.is_zero()).then(|| sctx.clone()),
        );

        let mut executor_ids = self.executor_ids.lock();
        if executor_ids.insert(executor_id) {
            self.sorted_executor_ids
                .store(Arc::new(executor_ids.iter().cloned().collect()));
        }
        Ok(())
    }

    fn add_job_contexts(&self, sctx: &SchedulingContext) {
        let mut job_contexts = self.job_contexts.lock();
        for qctx in sctx.queue_contexts.values() {
            let jctxs = qctx
                .successful_jobs
                .values()
                .chain(qctx.unsuccessful_jobs.values());
            for jctx in jctxs {
                let by_executor = job_contexts.get_or_insert_mut(jctx.job.id, HashMap::new);
                by_executor.insert(sctx.executor_id.clone(), Arc::new(jctx.clone()));
            }
        }
    }

    fn add_queue_contexts(&self, sctx: &SchedulingContext) -> Result<(), SchedulingError> {
        let mut most_recent = HashMap::clone(&self.most_recent_by_queue.load());
        let mut successful = HashMap::clone(&self.most_recent_successful_by_queue.load());
        let mut preempting = HashMap::clone(&self.most_recent_preempting_by_queue.load());
        for (queue, qctx) in &sctx.queue_contexts {
            if queue.is_empty() {
                return Err(SchedulingError::invalid_argument("queue", "empty queue name"));
            }
            let qctx = Arc::new(qctx.clone());
            insert_by_queue(&mut most_recent, queue, &sctx.executor_id, qctx.clone());
            if !qctx.scheduled_by_priority.is_zero() {
                insert_by_queue(&mut successful, queue, &sctx.executor_id, qctx.clone());
            }
            if !qctx.evicted_by_priority.is_zero() {
                insert_by_queue(&mut preempting, queue, &sctx.executor_id, qctx.clone());
            }
        }
        self.most_recent_by_queue.store(Arc::new(most_recent));
        self.most_recent_successful_by_queue.store(Arc::new(successful));
        self.most_recent_preempting_by_queue.store(Arc::new(preempting));
        Ok(())
    }

    pub fn get_scheduling_report(&self) -> SchedulingReport {
        SchedulingReport {
            most_recent: HashMap::clone(&self.most_recent.load()),
            most_recent_successful: HashMap::clone(&self.most_recent_successful.load()),
            most_recent_preempting: HashMap::clone(&self.most_recent_preempting.load()),
            sorted_executor_ids: Vec::clone(&self.sorted_executor_ids.load()),
        }
    }

    /// Per-executor view of one queue. Unknown queues yield an empty
    /// report, not an error.
    pub fn get_queue_report(&self, queue: &str) -> QueueReport {
        let queue = queue.trim();
        QueueReport {
            queue: queue.to_string(),
            most_recent: lookup_queue(&self.most_recent_by_queue.load(), queue),
            most_recent_successful: lookup_queue(
                &self.most_recent_successful_by_queue.load(),
                queue,
            ),
            most_recent_preempting: lookup_queue(
                &self.most_recent_preempting_by_queue.load(),
                queue,
            ),
            sorted_executor_ids: Vec::clone(&self.sorted_executor_ids.load()),
        }
    }

    /// Per-executor view of one job. Unknown jobs yield an empty report,
    /// not an error.
    pub fn get_job_report(&self, job_id: JobId) -> JobReport {
        let contexts = self
            .job_contexts
            .lock()
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        JobReport {
            job_id,
            contexts,
            sorted_executor_ids: Vec::clone(&self.sorted_executor_ids.load()),
        }
    }

    pub fn sorted_executor_ids(&self) -> Vec<String> {
        Vec::clone(&self.sorted_executor_ids.load())
    }
}

fn swap_in(
    target: &ArcSwap<ContextByExecutor>,
    executor_id: &str,
    sctx: Option<Arc<SchedulingContext>>,
) {
    let Some(sctx) = sctx else { return };
    let mut map = HashMap::clone(&target.load());
    map.insert(executor_id.to_string(), sctx);
    target.store(Arc::new(map));
}

fn insert_by_queue(
    target: &mut HashMap<String, QueueContextByExecutor>,
    queue: &str,
    executor_id: &str,
    qctx: Arc<QueueSchedulingContext>,
) {
    target
        .entry(queue.to_string())
        .or_default()
        .insert(executor_id.to_string(), qctx);
}

fn lookup_queue(
    map: &HashMap<String, QueueContextByExecutor>,
    queue: &str,
) -> QueueContextByExecutor {
    map.get(queue).cloned().unwrap_or_default()
}

/// Cluster-wide report: per executor, the most recent, most recent
/// successful, and most recent preempting rounds.
#[derive(Debug, Clone)]
pub struct SchedulingReport {
    pub most_recent: ContextByExecutor,
    pub most_recent_successful: ContextByExecutor,
    pub most_recent_preempting: ContextByExecutor,
    pub sorted_executor_ids: Vec<String>,
}

impl fmt::Display for SchedulingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for executor_id in &self.sorted_executor_ids {
            writeln!(f, "{executor_id}:")?;
            write_attempt(f, "Most recent attempt", self.most_recent.get(executor_id))?;
            write_attempt(
                f,
                "Most recent successful attempt",
                self.most_recent_successful.get(executor_id),
            )?;
            write_attempt(
                f,
                "Most recent preempting attempt",
                self.most_recent_preempting.get(executor_id),
            )?;
        }
        Ok(())
    }
}

fn write_attempt(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    sctx: Option<&Arc<SchedulingContext>>,
) -> fmt::Result {
    match sctx {
        Some(sctx) => {
            writeln!(f, "\t{title}:")?;
            for line in sctx.to_string().lines() {
                writeln!(f, "\t\t{line}")?;
            }
            Ok(())
        }
        None => writeln!(f, "\t{title}: none"),
    }
}

#[derive(Debug, Clone)]
pub struct QueueReport {
    pub queue: String,
    pub most_recent: QueueContextByExecutor,
    pub most_recent_successful: QueueContextByExecutor,
    pub most_recent_preempting: QueueContextByExecutor,
    pub sorted_executor_ids: Vec<String>,
}

impl fmt::Display for QueueReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for executor_id in &self.sorted_executor_ids {
            writeln!(f, "{executor_id}:")?;
            for (title, map) in [
                ("Most recent attempt", &self.most_recent),
                ("Most recent successful attempt", &self.most_recent_successful),
                ("Most recent preempting attempt", &self.most_recent_preempting),
            ] {
                match map.get(executor_id) {
                    Some(qctx) => {
                        writeln!(f, "\t{title}:")?;
                        for line in qctx.to_string().lines() {
                            writeln!(f, "\t\t{line}")?;
                        }
                    }
                    None => writeln!(f, "\t{title}: none")?,
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: JobId,
    pub contexts: JobContextByExecutor,
    pub sorted_executor_ids: Vec<String>,
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for executor_id in &self.sorted_executor_ids {
            match self.contexts.get(executor_id) {
                Some(jctx) => {
                    writeln!(f, "{executor_id}:")?;
                    for line in jctx.to_string().lines() {
                        writeln!(f, "\t{line}")?;
                    }
                }
                None => writeln!(f, "{executor_id}: no recent attempt")?,
            }
        }
        Ok(())
    }
}
