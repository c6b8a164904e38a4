//! Scheduler configuration.
//!
//! Plain serde structs with defaults and validation; loading them from a
//! file or the environment is the embedding binary's concern.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use stevedore_core::{PriorityClass, Quantity, ResourceList, SchedulingError, Toleration};

/// Top-level configuration for the scheduling service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfiguration {
    /// How often the service wakes up.
    pub cycle_period_ms: u64,
    /// How often a wake-up runs a full scheduling round.
    pub schedule_period_ms: u64,
    /// Cooperative deadline for one round, checked between gangs.
    pub max_scheduling_duration_ms: u64,
    /// Executors silent for longer than this have their nodes purged.
    pub executor_timeout_secs: u64,
    /// Batch size for reads from the job store.
    pub max_fetch_size: usize,
    /// Bound on retries of transient publish errors.
    pub max_retries: u32,
    pub scheduling: SchedulingConfig,
}

impl Default for SchedulerConfiguration {
    fn default() -> Self {
        SchedulerConfiguration {
            cycle_period_ms: 1_000,
            schedule_period_ms: 10_000,
            max_scheduling_duration_ms: 5_000,
            executor_timeout_secs: 600,
            max_fetch_size: 1_000,
            max_retries: 3,
            scheduling: SchedulingConfig::default(),
        }
    }
}

impl SchedulerConfiguration {
    pub fn validate(&self) -> Result<(), SchedulingError> {
        if self.cycle_period_ms == 0 {
            return Err(SchedulingError::invalid_argument(
                "cycle_period_ms",
                "must be positive",
            ));
        }
        if self.max_fetch_size == 0 {
            return Err(SchedulingError::invalid_argument(
                "max_fetch_size",
                "must be positive",
            ));
        }
        self.scheduling.validate()
    }
}

/// Per-round scheduling behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// How many failed gangs a queue may accumulate before it is done for
    /// the round.
    pub max_queue_lookback: usize,
    /// Hard cap on jobs scheduled per round. `None` is unlimited.
    #[serde(default)]
    pub maximum_jobs_to_schedule: Option<usize>,
    /// Hard cap on gangs scheduled per round. `None` is unlimited.
    #[serde(default)]
    pub maximum_gangs_to_schedule: Option<usize>,
    /// Fraction of total resources that may be newly scheduled per round.
    #[serde(default)]
    pub maximum_resource_fraction_to_schedule: HashMap<String, f64>,
    /// Per-pool overrides of the round cap. Pools without an entry use the
    /// global value.
    #[serde(default)]
    pub maximum_resource_fraction_to_schedule_by_pool: HashMap<String, HashMap<String, f64>>,
    /// Requests below this minimum are rejected as too small.
    #[serde(default)]
    pub minimum_job_size: ResourceList,
    /// Requests applied to jobs that omit a resource entirely.
    #[serde(default)]
    pub default_job_limits: ResourceList,
    /// Tolerations granted to every job.
    #[serde(default)]
    pub default_job_tolerations: Vec<Toleration>,
    /// Resources included in node-DB index keys, with their quantization
    /// resolution.
    pub indexed_resources: Vec<IndexedResource>,
    /// Taint keys that contribute to a node's type.
    #[serde(default)]
    pub indexed_taints: Vec<String>,
    /// Label keys that contribute to a node's type.
    #[serde(default)]
    pub indexed_node_labels: Vec<String>,
    /// Extra candidates to examine after the first fit, trading solution
    /// quality for latency.
    pub max_extra_nodes_to_consider: usize,
    /// Annotation keys a submitted job's gang descriptor is parsed from.
    pub gang_id_annotation: String,
    pub gang_cardinality_annotation: String,
    /// Bound on the report repository's per-job context cache.
    pub max_job_scheduling_contexts_per_executor: usize,
    /// Executors holding this many leases they have not yet pulled are
    /// skipped until they catch up.
    pub max_unacknowledged_jobs_per_executor: usize,
    pub preemption: PreemptionConfig,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        SchedulingConfig {
            max_queue_lookback: 1_000,
            maximum_jobs_to_schedule: None,
            maximum_gangs_to_schedule: None,
            maximum_resource_fraction_to_schedule: HashMap::new(),
            maximum_resource_fraction_to_schedule_by_pool: HashMap::new(),
            minimum_job_size: ResourceList::new(),
            default_job_limits: ResourceList::new(),
            default_job_tolerations: Vec::new(),
            indexed_resources: vec![IndexedResource {
                name: "cpu".to_string(),
                resolution: Quantity::from_millis(1),
            }],
            indexed_taints: Vec::new(),
            indexed_node_labels: Vec::new(),
            max_extra_nodes_to_consider: 0,
            gang_id_annotation: "stevedore.io/gang-id".to_string(),
            gang_cardinality_annotation: "stevedore.io/gang-cardinality".to_string(),
            max_job_scheduling_contexts_per_executor: 10_000,
            max_unacknowledged_jobs_per_executor: 2_500,
            preemption: PreemptionConfig::default(),
        }
    }
}

impl SchedulingConfig {
    pub fn validate(&self) -> Result<(), SchedulingError> {
        if self.indexed_resources.is_empty() {
            return Err(SchedulingError::invalid_argument(
                "indexed_resources",
                "at least one indexed resource is required",
            ));
        }
        for fraction in self
            .maximum_resource_fraction_to_schedule
            .values()
            .chain(
                self.maximum_resource_fraction_to_schedule_by_pool
                    .values()
                    .flat_map(|m| m.values()),
            )
        {
            if !(0.0..=1.0).contains(fraction) {
                return Err(SchedulingError::invalid_argument(
                    "maximum_resource_fraction_to_schedule",
                    "fractions must be within [0, 1]",
                ));
            }
        }
        self.preemption.validate()?;
        Ok(())
    }

    /// The class a job refers to, falling back to the default class for
    /// unknown names.
    pub fn priority_class(&self, name: &str) -> &PriorityClass {
        self.preemption
            .priority_classes
            .get(name)
            .unwrap_or_else(|| self.default_priority_class())
    }

    pub fn default_priority_class(&self) -> &PriorityClass {
        &self.preemption.priority_classes[&self.preemption.default_priority_class]
    }

    /// All configured priorities, ascending and deduplicated.
    pub fn priorities(&self) -> Vec<i32> {
        let mut priorities: Vec<i32> = self
            .preemption
            .priority_classes
            .values()
            .map(|pc| pc.priority)
            .collect();
        priorities.sort_unstable();
        priorities.dedup();
        priorities
    }

    /// The round cap applying to `pool`: the pool override when present,
    /// the global cap otherwise.
    pub fn round_cap_for_pool(&self, pool: &str) -> &HashMap<String, f64> {
        self.maximum_resource_fraction_to_schedule_by_pool
            .get(pool)
            .unwrap_or(&self.maximum_resource_fraction_to_schedule)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedResource {
    pub name: String,
    pub resolution: Quantity,
}

/// Eviction behavior of the preemption planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreemptionConfig {
    pub enabled: bool,
    /// Probability that a node's preemptible work is put up for eviction.
    pub node_eviction_probability: f64,
    /// Probability applied to oversubscribed nodes instead.
    pub node_oversubscription_eviction_probability: f64,
    /// Per-round ceiling on evicted resources, as a fraction of total
    /// resources per resource name.
    pub maximum_eviction_fraction: f64,
    pub priority_classes: HashMap<String, PriorityClass>,
    pub default_priority_class: String,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        let mut priority_classes = HashMap::new();
        priority_classes.insert(
            "stevedore-default".to_string(),
            PriorityClass::new(1000, false),
        );
        priority_classes.insert(
            "stevedore-preemptible".to_string(),
            PriorityClass::new(900, true),
        );
        PreemptionConfig {
            enabled: false,
            node_eviction_probability: 1.0,
            node_oversubscription_eviction_probability: 1.0,
            maximum_eviction_fraction: 1.0,
            priority_classes,
            default_priority_class: "stevedore-default".to_string(),
        }
    }
}

impl PreemptionConfig {
    pub fn validate(&self) -> Result<(), SchedulingError> {
        for probability in [
            self.node_eviction_probability,
            self.node_oversubscription_eviction_probability,
        ] {
            if !(0.0..=1.0).contains(&probability) {
                return Err(SchedulingError::invalid_argument(
                    "preemption",
                    "eviction probabilities must be within [0, 1]",
                ));
            }
        }
        if self.priority_classes.is_empty() {
            return Err(SchedulingError::invalid_argument(
                "preemption.priority_classes",
                "at least one priority class is required",
            ));
        }
        if !self.priority_classes.contains_key(&self.default_priority_class) {
            return Err(SchedulingError::invalid_argument(
                "preemption.default_priority_class",
                format!("unknown priority class {:?}", self.default_priority_class),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_valid() {
        SchedulerConfiguration::default().validate().unwrap();
    }

    #[test]
    fn test_unknown_default_priority_class_rejected() {
        let mut config = SchedulerConfiguration::default();
        config.scheduling.preemption.default_priority_class = "no-such-class".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_fraction_rejected() {
        let mut config = SchedulerConfiguration::default();
        config
            .scheduling
            .maximum_resource_fraction_to_schedule
            .insert("cpu".to_string(), 1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_cap_pool_override() {
        let mut config = SchedulingConfig::default();
        config
            .maximum_resource_fraction_to_schedule
            .insert("cpu".to_string(), 0.5);
        config.maximum_resource_fraction_to_schedule_by_pool.insert(
            "gpu-pool".to_string(),
            HashMap::from([("cpu".to_string(), 0.25)]),
        );
        assert_eq!(config.round_cap_for_pool("gpu-pool")["cpu"], 0.25);
        assert_eq!(config.round_cap_for_pool("other")["cpu"], 0.5);
    }

    #[test]
    fn test_priority_class_fallback() {
        let config = SchedulingConfig::default();
        assert_eq!(config.priority_class("stevedore-preemptible").priority, 900);
        assert_eq!(config.priority_class("never-configured").priority, 1000);
    }
}
