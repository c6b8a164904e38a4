//! The scheduling service: periodic rounds, executor lease handling, and
//! leader-gated publication.
//!
//! Each executor has its own node DB, fed by its lease requests. A round
//! computes a plan per executor; the plan is committed and published only
//! if the leader token taken at round start still validates at publish
//! time, otherwise it is discarded silently. Transient collaborator errors
//! abort the round without mutating node DB or report store; a fatal
//! invariant violation latches scheduling off until restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use stevedore_core::{Job, JobId, ResourceListByPriority, SchedulingError};
use stevedore_ports::{
    EventPublisher, EventSequence, JobRepository, JobRunEvent, JobRunLease, LeaderController,
    LeaseRequest, LeaseResponse,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfiguration;
use crate::constraints::SchedulingConstraints;
use crate::context::SchedulingContext;
use crate::nodedb::NodeDb;
use crate::preemption::PreemptingQueueScheduler;
use crate::queue_scheduler::RoundControl;
use crate::reports::SchedulingContextRepository;

struct ExecutorRecord {
    pool: String,
    last_seen: chrono::DateTime<Utc>,
    node_db: Arc<NodeDb>,
}

/// What one round did, per executor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoundSummary {
    pub scheduled_jobs: usize,
    pub preempted_jobs: usize,
    /// False when the plan was discarded because leadership lapsed.
    pub published: bool,
}

pub struct SchedulingService<R, P, L> {
    config: SchedulerConfiguration,
    reports: Arc<SchedulingContextRepository>,
    job_repository: Arc<R>,
    publisher: Arc<P>,
    leader: Arc<L>,
    executors: Mutex<HashMap<String, ExecutorRecord>>,
    /// Leases computed by rounds, waiting for each executor's next pull.
    pending_leases: Mutex<HashMap<String, LeaseResponse>>,
    /// Run ids assigned to leased jobs, needed to name them in later
    /// preemption or cancellation events.
    run_ids: Mutex<HashMap<JobId, Uuid>>,
    priority_factors: Mutex<HashMap<String, f64>>,
    /// Latched on a fatal error; stays set until restart.
    scheduling_disabled: AtomicBool,
}

impl<R, P, L> SchedulingService<R, P, L>
where
    R: JobRepository,
    P: EventPublisher,
    L: LeaderController,
{
    pub fn new(
        config: SchedulerConfiguration,
        job_repository: Arc<R>,
        publisher: Arc<P>,
        leader: Arc<L>,
    ) -> Result<Self, SchedulingError> {
        config.validate()?;
        let reports = Arc::new(SchedulingContextRepository::new(
            config.scheduling.max_job_scheduling_contexts_per_executor,
        )?);
        Ok(SchedulingService {
            config,
            reports,
            job_repository,
            publisher,
            leader,
            executors: Mutex::new(HashMap::new()),
            pending_leases: Mutex::new(HashMap::new()),
            run_ids: Mutex::new(HashMap::new()),
            priority_factors: Mutex::new(HashMap::new()),
            scheduling_disabled: AtomicBool::new(false),
        })
    }

    pub fn reports(&self) -> Arc<SchedulingContextRepository> {
        self.reports.clone()
    }

    /// Smaller factor means a larger fair share for the queue.
    pub fn set_queue_priority_factor(&self, queue: impl Into<String>, factor: f64) {
        self.priority_factors.lock().insert(queue.into(), factor);
    }

    /// An executor pulling work: record the heartbeat, absorb its node
    /// report, and hand back whatever the last round assigned to it.
    pub fn handle_lease_request(
        &self,
        request: LeaseRequest,
    ) -> Result<LeaseResponse, SchedulingError> {
        if request.executor_id.is_empty() {
            return Err(SchedulingError::invalid_argument(
                "executor_id",
                "empty executor id",
            ));
        }
        let node_db = {
            let mut executors = self.executors.lock();
            let record = executors
                .entry(request.executor_id.clone())
                .or_insert_with(|| ExecutorRecord {
                    pool: request.pool.clone(),
                    last_seen: Utc::now(),
                    node_db: Arc::new(NodeDb::new(&self.config.scheduling)),
                });
            record.last_seen = Utc::now();
            record.pool = request.pool.clone();
            record.node_db.clone()
        };
        node_db.upsert_many(request.nodes)?;
        let mut response = self
            .pending_leases
            .lock()
            .remove(&request.executor_id)
            .unwrap_or_default();
        // Runs the executor reports but the scheduler never assigned are
        // told to stop.
        if !request.unassigned_run_ids.is_empty() {
            let known: std::collections::HashSet<Uuid> =
                self.run_ids.lock().values().copied().collect();
            response.to_cancel.extend(
                request
                    .unassigned_run_ids
                    .into_iter()
                    .filter(|run_id| !known.contains(run_id)),
            );
        }
        Ok(response)
    }

    /// Drive rounds until `shutdown` fires. A full round runs every
    /// `schedule_period_ms`; intermediate wake-ups only age out executors.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.cycle_period_ms));
        let schedule_period = Duration::from_millis(self.config.schedule_period_ms);
        let mut last_round = Instant::now()
            .checked_sub(schedule_period)
            .unwrap_or_else(Instant::now);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("scheduling loop shutting down");
                    return;
                }
            }
            self.purge_stale_executors();
            if last_round.elapsed() < schedule_period {
                continue;
            }
            last_round = Instant::now();
            match self.run_round(shutdown.clone()).await {
                Ok(summaries) => {
                    let scheduled: usize = summaries.values().map(|s| s.scheduled_jobs).sum();
                    debug!(executors = summaries.len(), scheduled, "round complete");
                }
                Err(err) if err.is_fatal() => {
                    error!(%err, "fatal error; scheduling disabled until restart");
                    self.scheduling_disabled.store(true, Ordering::SeqCst);
                }
                Err(err) if err.is_transient() => {
                    warn!(%err, "transient error; round abandoned, retrying next cycle");
                }
                Err(err) => {
                    warn!(%err, "round failed");
                }
            }
        }
    }

    /// Compute and, if still leader, commit and publish one round across
    /// all executors.
    pub async fn run_round(
        &self,
        cancel: watch::Receiver<bool>,
    ) -> Result<HashMap<String, RoundSummary>, SchedulingError> {
        let mut summaries = HashMap::new();
        if self.scheduling_disabled.load(Ordering::SeqCst) {
            warn!("scheduling is disabled after a fatal error");
            return Ok(summaries);
        }
        let Some(token) = self.leader.token() else {
            debug!("not leader; skipping round");
            return Ok(summaries);
        };

        let mut pending = self.fetch_pending_jobs().await?;
        let executors: Vec<(String, String, Arc<NodeDb>)> = {
            let executors = self.executors.lock();
            executors
                .iter()
                .map(|(id, record)| (id.clone(), record.pool.clone(), record.node_db.clone()))
                .collect()
        };

        for (executor_id, pool, node_db) in executors {
            let unacknowledged = self
                .pending_leases
                .lock()
                .get(&executor_id)
                .map(|r| r.leased.len())
                .unwrap_or(0);
            if unacknowledged >= self.config.scheduling.max_unacknowledged_jobs_per_executor {
                warn!(
                    executor = %executor_id,
                    unacknowledged,
                    "executor has too many unacknowledged leases; skipping"
                );
                continue;
            }
            let deadline = Instant::now()
                + Duration::from_millis(self.config.max_scheduling_duration_ms);
            let control = RoundControl {
                deadline: Some(deadline),
                cancel: Some(cancel.clone()),
            };
            let mut txn = node_db.txn();
            let mut sctx =
                SchedulingContext::new(executor_id.clone(), pool.clone(), node_db.total_resources());
            self.register_queues(&mut sctx, &node_db, &pending)?;

            let constraints = SchedulingConstraints::from_config(
                &pool,
                node_db.total_resources(),
                &self.config.scheduling,
            );
            let scheduler =
                PreemptingQueueScheduler::new(&constraints, &self.config.scheduling);
            let jobs_by_queue = jobs_by_queue(&pending);
            let mut rng = StdRng::from_entropy();
            let result = scheduler.schedule(&mut txn, &mut sctx, jobs_by_queue, &control, &mut rng)?;

            // Leader-gated publication: if the token lapsed while we were
            // planning, the whole plan is discarded silently.
            if !self.leader.validate(token) {
                debug!(executor = %executor_id, "leadership lapsed; discarding plan");
                summaries.insert(
                    executor_id,
                    RoundSummary {
                        published: false,
                        ..RoundSummary::default()
                    },
                );
                continue;
            }

            txn.commit()?;
            let summary = self.publish_round(&executor_id, &sctx, &result).await?;
            self.reports.add_scheduling_context(Arc::new(sctx.clone()))?;

            // Jobs scheduled here must not be offered to other executors.
            let scheduled: std::collections::HashSet<JobId> = sctx
                .queue_contexts
                .values()
                .flat_map(|qctx| qctx.successful_jobs.keys().copied())
                .collect();
            pending.retain(|job| !scheduled.contains(&job.id));
            summaries.insert(executor_id, summary);
        }
        Ok(summaries)
    }

    async fn fetch_pending_jobs(&self) -> Result<Vec<Job>, SchedulingError> {
        let limit = self.config.max_fetch_size;
        let mut jobs = Vec::new();
        let mut after = None;
        loop {
            let batch = self.job_repository.fetch_pending(after, limit).await?;
            let batch_len = batch.len();
            after = batch.last().map(|job| job.id);
            jobs.extend(batch);
            if batch_len < limit {
                return Ok(jobs);
            }
        }
    }

    /// Register every queue visible to this executor: queues with pending
    /// work and queues with jobs already running on its nodes.
    fn register_queues(
        &self,
        sctx: &mut SchedulingContext,
        node_db: &NodeDb,
        pending: &[Job],
    ) -> Result<(), SchedulingError> {
        let factors = self.priority_factors.lock();
        let mut allocated: BTreeMap<String, ResourceListByPriority> = BTreeMap::new();
        let snapshot = node_db.snapshot();
        for node in snapshot.nodes() {
            for running in node.running_jobs.values() {
                allocated
                    .entry(running.job.queue.clone())
                    .or_default()
                    .add_at(running.priority, running.requests());
            }
        }
        for job in pending {
            allocated.entry(job.queue.clone()).or_default();
        }
        for (queue, allocated_by_priority) in allocated {
            let factor = factors.get(&queue).copied().unwrap_or(1.0);
            sctx.add_queue_scheduling_context(queue, factor, allocated_by_priority)?;
        }
        Ok(())
    }

    /// Turn the round's outcome into lease responses and events, and push
    /// them out with bounded retries.
    async fn publish_round(
        &self,
        executor_id: &str,
        sctx: &SchedulingContext,
        result: &crate::preemption::PreemptionResult,
    ) -> Result<RoundSummary, SchedulingError> {
        let mut events_by_job_set: BTreeMap<String, Vec<JobRunEvent>> = BTreeMap::new();
        let mut leases = Vec::new();
        let mut to_preempt = Vec::new();

        {
            let mut run_ids = self.run_ids.lock();
            for qctx in sctx.queue_contexts.values() {
                for jctx in qctx.successful_jobs.values() {
                    // Evicted jobs that found a place again are handled
                    // below; one back on its own node keeps its run.
                    if jctx.rescheduled_after_eviction {
                        continue;
                    }
                    let node_id = jctx.assigned_node.clone().unwrap_or_default();
                    let run_id = *run_ids.entry(jctx.job.id).or_insert_with(Uuid::new_v4);
                    leases.push(JobRunLease {
                        job_id: jctx.job.id,
                        run_id,
                        queue: jctx.job.queue.clone(),
                        job_set: jctx.job.job_set.clone(),
                        node_id: node_id.clone(),
                    });
                    events_by_job_set
                        .entry(jctx.job.job_set.clone())
                        .or_default()
                        .push(JobRunEvent::Leased {
                            job_id: jctx.job.id,
                            run_id,
                            executor_id: executor_id.to_string(),
                            node_id,
                        });
                }
            }
            for moved in &result.rescheduled {
                if moved.original_node == moved.new_node {
                    continue;
                }
                let Some(jctx) = sctx
                    .queue_contexts
                    .get(&moved.queue)
                    .and_then(|qctx| qctx.successful_jobs.get(&moved.job_id))
                else {
                    continue;
                };
                let run_id = *run_ids.entry(moved.job_id).or_insert_with(Uuid::new_v4);
                leases.push(JobRunLease {
                    job_id: moved.job_id,
                    run_id,
                    queue: moved.queue.clone(),
                    job_set: jctx.job.job_set.clone(),
                    node_id: moved.new_node.clone(),
                });
                events_by_job_set
                    .entry(jctx.job.job_set.clone())
                    .or_default()
                    .push(JobRunEvent::Leased {
                        job_id: moved.job_id,
                        run_id,
                        executor_id: executor_id.to_string(),
                        node_id: moved.new_node.clone(),
                    });
            }
            for evicted in &result.preempted {
                let run_id = *run_ids.entry(evicted.job.id).or_insert_with(Uuid::new_v4);
                to_preempt.push(run_id);
                events_by_job_set
                    .entry(evicted.job.job_set.clone())
                    .or_default()
                    .push(JobRunEvent::Preempted {
                        job_id: evicted.job.id,
                        run_id,
                        reason: evicted.reason.clone(),
                    });
            }
        }

        let summary = RoundSummary {
            scheduled_jobs: leases.len(),
            preempted_jobs: to_preempt.len(),
            published: true,
        };

        if !leases.is_empty() || !to_preempt.is_empty() {
            let mut responses = self.pending_leases.lock();
            let response = responses.entry(executor_id.to_string()).or_default();
            response.leased.extend(leases);
            response.to_preempt.extend(to_preempt);
        }

        let sequences: Vec<EventSequence> = events_by_job_set
            .into_iter()
            .map(|(job_set, events)| EventSequence { job_set, events })
            .collect();
        if !sequences.is_empty() {
            self.publish_with_retry(sequences).await?;
        }
        // The per-partition marker closes the round for consumers even
        // when nothing was scheduled.
        self.publisher
            .publish_markers(Uuid::new_v4())
            .await
            .map_err(SchedulingError::from)?;
        Ok(summary)
    }

    async fn publish_with_retry(
        &self,
        sequences: Vec<EventSequence>,
    ) -> Result<(), SchedulingError> {
        let mut attempt = 0u32;
        let mut backoff = Duration::from_millis(100);
        loop {
            match self.publisher.publish(sequences.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(%err, attempt, "publish failed; backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn purge_stale_executors(&self) {
        let timeout = chrono::Duration::seconds(self.config.executor_timeout_secs as i64);
        let now = Utc::now();
        let mut executors = self.executors.lock();
        executors.retain(|executor_id, record| {
            let alive = now.signed_duration_since(record.last_seen) <= timeout;
            if !alive {
                info!(executor = %executor_id, "executor timed out; purging its nodes");
            }
            alive
        });
    }
}

fn jobs_by_queue(jobs: &[Job]) -> BTreeMap<String, Vec<Job>> {
    let mut by_queue: BTreeMap<String, Vec<Job>> = BTreeMap::new();
    for job in jobs {
        by_queue.entry(job.queue.clone()).or_default().push(job.clone());
    }
    by_queue
}
