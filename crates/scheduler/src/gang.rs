//! Atomic scheduling of one gang against the node DB.
//!
//! Members are placed one by one inside a transaction checkpoint; any
//! member failing, or the gang tripping a cap, rolls the checkpoint back so
//! no partial placement is ever visible outside.

use stevedore_core::SchedulingError;
use tracing::debug;

use crate::config::SchedulingConfig;
use crate::constraints::{SchedulingConstraints, UnschedulableReason};
use crate::context::{GangSchedulingContext, SchedulingContext};
use crate::nodedb::{NodeDbTxn, SelectionOutcome};

pub struct GangScheduler<'a> {
    constraints: &'a SchedulingConstraints,
    config: &'a SchedulingConfig,
}

impl<'a> GangScheduler<'a> {
    pub fn new(constraints: &'a SchedulingConstraints, config: &'a SchedulingConfig) -> Self {
        GangScheduler {
            constraints,
            config,
        }
    }

    /// Try to place every member of `gctx`. Returns `None` when the gang
    /// was scheduled, or the reason it was not. `Err` is reserved for
    /// invariant violations, not expected outcomes.
    pub fn schedule(
        &self,
        txn: &mut NodeDbTxn<'_>,
        sctx: &mut SchedulingContext,
        mut gctx: GangSchedulingContext,
    ) -> Result<Option<UnschedulableReason>, SchedulingError> {
        // Round-terminal checks run against totals excluding this gang: a
        // gang admitted at the cap may overshoot it once.
        if let Some(reason) = self.constraints.check_round(sctx, gctx.len()) {
            return Ok(Some(reason));
        }
        for jctx in &gctx.jctxs {
            if let Some(reason) = self.constraints.check_job_size(&jctx.job.requests) {
                return self.fail(txn, None, sctx, gctx, reason);
            }
        }

        let checkpoint = txn.checkpoint();
        let mut class_tolerations = self
            .config
            .priority_class(&gctx.priority_class)
            .tolerations
            .clone();
        class_tolerations.extend_from_slice(&self.config.default_job_tolerations);

        for i in 0..gctx.jctxs.len() {
            let outcome =
                txn.select_node_for_job(&gctx.jctxs[i].job, gctx.priority, &class_tolerations);
            match outcome {
                SelectionOutcome::Selected(selection) => {
                    match txn.bind_job(
                        &gctx.jctxs[i].job,
                        gctx.priority,
                        gctx.preemptible,
                        &selection.node_id,
                    ) {
                        Ok(()) => gctx.jctxs[i].assigned_node = Some(selection.node_id),
                        // Capacity seen through priority headroom can be
                        // claimed by an earlier binding at a lower priority.
                        Err(SchedulingError::InsufficientResources { .. }) => {
                            return self.fail(
                                txn,
                                Some(checkpoint),
                                sctx,
                                gctx,
                                UnschedulableReason::NoNodeFits,
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
                SelectionOutcome::NoFit(summary) => {
                    debug!(
                        job_id = %gctx.jctxs[i].job.id,
                        queue = %gctx.queue,
                        %summary,
                        "gang member fits on no node"
                    );
                    gctx.jctxs[i].no_fit = Some(summary);
                    return self.fail(
                        txn,
                        Some(checkpoint),
                        sctx,
                        gctx,
                        UnschedulableReason::NoNodeFits,
                    );
                }
            }
        }

        // Per-queue caps are checked assuming the full gang succeeds:
        // cumulative usage at and above the gang's priority, gang included.
        let qctx = sctx.queue_context(&gctx.queue).ok_or_else(|| {
            SchedulingError::invalid_argument("queue", format!("unknown queue {}", gctx.queue))
        })?;
        let mut prospective = qctx.allocated_by_priority.allocated_at_least(gctx.priority);
        prospective.add(&gctx.total_requests);
        if let Some(reason) =
            self.constraints
                .check_queue_caps(&gctx.queue, gctx.priority, &prospective)
        {
            return self.fail(txn, Some(checkpoint), sctx, gctx, reason);
        }

        sctx.add_gang_scheduling_context(gctx)?;
        Ok(None)
    }

    /// Roll back any member placements and record the whole gang as
    /// unsuccessful under a single gang-level reason.
    fn fail(
        &self,
        txn: &mut NodeDbTxn<'_>,
        checkpoint: Option<crate::nodedb::TxnCheckpoint>,
        sctx: &mut SchedulingContext,
        mut gctx: GangSchedulingContext,
        reason: UnschedulableReason,
    ) -> Result<Option<UnschedulableReason>, SchedulingError> {
        if let Some(checkpoint) = checkpoint {
            txn.rollback_to(checkpoint);
        }
        for jctx in gctx.jctxs.iter_mut() {
            jctx.assigned_node = None;
            jctx.unschedulable_reason = Some(reason.clone());
        }
        for jctx in gctx.jctxs {
            sctx.add_job_scheduling_context(jctx)?;
        }
        Ok(Some(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GangSchedulingContext;
    use crate::nodedb::NodeDb;
    use crate::testfixtures::{
        cpu_gang, cpu_job, cpu_node, cpu_resources, job_context, test_scheduling_config,
    };
    use stevedore_core::{Job, ResourceListByPriority};

    struct Harness {
        config: crate::config::SchedulingConfig,
        db: NodeDb,
        sctx: SchedulingContext,
    }

    impl Harness {
        fn new(nodes: Vec<stevedore_core::Node>) -> Self {
            Self::with_config(nodes, test_scheduling_config())
        }

        fn with_config(
            nodes: Vec<stevedore_core::Node>,
            config: crate::config::SchedulingConfig,
        ) -> Self {
            let db = NodeDb::new(&config);
            db.upsert_many(nodes).unwrap();
            let mut sctx =
                SchedulingContext::new("executor-1", "pool", db.total_resources());
            sctx.add_queue_scheduling_context("queue-a", 1.0, ResourceListByPriority::new())
                .unwrap();
            Harness { config, db, sctx }
        }

        fn gctx(&self, jobs: &[Job]) -> GangSchedulingContext {
            let class = self.config.priority_class(&jobs[0].priority_class);
            let jctxs = jobs
                .iter()
                .map(|job| {
                    crate::context::JobSchedulingContext::from_job(
                        job.clone(),
                        "executor-1",
                        class.priority,
                    )
                })
                .collect();
            GangSchedulingContext::new(jctxs, class.preemptible).unwrap()
        }

        fn schedule(&mut self, jobs: &[Job]) -> Option<UnschedulableReason> {
            let constraints = SchedulingConstraints::from_config(
                "pool",
                self.db.total_resources(),
                &self.config,
            );
            let scheduler = GangScheduler::new(&constraints, &self.config);
            let mut txn = self.db.txn();
            let gctx = self.gctx(jobs);
            let outcome = scheduler.schedule(&mut txn, &mut self.sctx, gctx).unwrap();
            txn.commit().unwrap();
            outcome
        }
    }

    #[test]
    fn test_gang_fitting_on_one_node_schedules() {
        let mut harness = Harness::new(vec![cpu_node("node-0", 32)]);
        let gang = cpu_gang("queue-a", "class-0", 32);
        assert_eq!(harness.schedule(&gang), None);
        let qctx = harness.sctx.queue_context("queue-a").unwrap();
        assert_eq!(qctx.successful_jobs.len(), 32);
        assert_eq!(
            harness.db.get_node("node-0").unwrap().allocatable_at(0),
            cpu_resources(0)
        );
    }

    #[test]
    fn test_oversized_gang_leaves_node_empty() {
        let mut harness = Harness::new(vec![cpu_node("node-0", 32)]);
        let gang = cpu_gang("queue-a", "class-0", 33);
        assert_eq!(
            harness.schedule(&gang),
            Some(UnschedulableReason::NoNodeFits)
        );
        // Atomicity: the 32 members that did fit were rolled back.
        let node = harness.db.get_node("node-0").unwrap();
        assert!(node.running_jobs.is_empty());
        assert_eq!(node.allocatable_at(0), cpu_resources(32));
        let qctx = harness.sctx.queue_context("queue-a").unwrap();
        assert_eq!(qctx.unsuccessful_jobs.len(), 33);
        assert!(qctx
            .unsuccessful_jobs
            .values()
            .all(|jctx| jctx.unschedulable_reason == Some(UnschedulableReason::NoNodeFits)));
    }

    #[test]
    fn test_gang_spanning_nodes() {
        let mut harness = Harness::new(vec![cpu_node("node-0", 32), cpu_node("node-1", 32)]);
        let gang = cpu_gang("queue-a", "class-0", 64);
        assert_eq!(harness.schedule(&gang), None);
        assert_eq!(harness.sctx.num_scheduled_jobs, 64);
    }

    #[test]
    fn test_second_gang_fails_when_node_is_full() {
        let mut harness = Harness::new(vec![cpu_node("node-0", 32)]);
        assert_eq!(harness.schedule(&cpu_gang("queue-a", "class-0", 32)), None);
        assert_eq!(
            harness.schedule(&cpu_gang("queue-a", "class-0", 1)),
            Some(UnschedulableReason::NoNodeFits)
        );
    }

    #[test]
    fn test_round_cap_stops_scheduling() {
        let mut config = test_scheduling_config();
        config
            .maximum_resource_fraction_to_schedule
            .insert("cpu".to_string(), 0.5);
        let mut harness = Harness::with_config(vec![cpu_node("node-0", 32)], config);

        // 8 then 16 admit (the cap is checked before each gang), then the
        // round is over.
        assert_eq!(harness.schedule(&cpu_gang("queue-a", "class-0", 8)), None);
        assert_eq!(harness.schedule(&cpu_gang("queue-a", "class-0", 16)), None);
        let reason = harness
            .schedule(&cpu_gang("queue-a", "class-0", 8))
            .unwrap();
        assert!(matches!(
            reason,
            UnschedulableReason::RoundResourceCapExceeded { .. }
        ));
        assert!(reason.is_round_terminal());
    }

    #[test]
    fn test_per_queue_priority_caps_follow_scenario() {
        let mut config = test_scheduling_config();
        for (class, fraction) in [
            ("class-0", 1.0),
            ("class-1", 15.0 / 32.0),
            ("class-2", 10.0 / 32.0),
            ("class-3", 3.0 / 32.0),
        ] {
            let pc = config.preemption.priority_classes.get_mut(class).unwrap();
            pc.maximum_resource_fraction_per_queue =
                std::collections::HashMap::from([("cpu".to_string(), fraction)]);
        }
        let mut harness = Harness::with_config(vec![cpu_node("node-0", 32)], config);

        let gangs = [
            ("class-3", 4),
            ("class-3", 3),
            ("class-2", 8),
            ("class-2", 7),
            ("class-1", 6),
            ("class-1", 5),
            ("class-0", 18),
            ("class-0", 17),
        ];
        let mut scheduled = Vec::new();
        for (i, (class, size)) in gangs.iter().enumerate() {
            let gang = cpu_gang("queue-a", class, *size);
            if harness.schedule(&gang).is_none() {
                scheduled.push(i);
            }
        }
        assert_eq!(scheduled, vec![1, 3, 5, 7]);
    }

    #[test]
    fn test_minimum_job_size() {
        let mut config = test_scheduling_config();
        config.minimum_job_size = cpu_resources(2);
        let mut harness = Harness::with_config(vec![cpu_node("node-0", 32)], config);
        let job = cpu_job("queue-a", 0, 1);
        let reason = harness.schedule(std::slice::from_ref(&job)).unwrap();
        assert!(matches!(reason, UnschedulableReason::JobTooSmall { .. }));
        assert!(!reason.is_round_terminal());
    }

    #[test]
    fn test_unsuccessful_members_record_node_reasons() {
        let mut harness = Harness::new(vec![cpu_node("node-0", 2)]);
        let gang = cpu_gang("queue-a", "class-0", 3);
        assert!(harness.schedule(&gang).is_some());
        let qctx = harness.sctx.queue_context("queue-a").unwrap();
        // The member that failed carries the per-node rejection summary.
        assert!(qctx.unsuccessful_jobs.values().any(|j| j.no_fit.is_some()));
    }

    #[test]
    fn test_mixed_class_gang_is_invalid() {
        let harness = Harness::new(vec![cpu_node("node-0", 32)]);
        let a = job_context(&cpu_job("queue-a", 0, 1), "executor-1");
        let mut b_job = cpu_job("queue-a", 0, 1);
        b_job.priority_class = "class-1".to_string();
        let b = job_context(&b_job, "executor-1");
        assert!(GangSchedulingContext::new(vec![a, b], true).is_err());
        drop(harness);
    }
}
