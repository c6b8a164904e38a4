//! Compute nodes and placement predicates: taints, tolerations, selectors,
//! affinity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};
use crate::resources::{ResourceList, ResourceListByPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A repellent mark on a node. Only `NoSchedule`/`NoExecute` taints without
/// a matching toleration exclude a node from placement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Taint {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

impl PartialOrd for TaintEffect {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaintEffect {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(e: &TaintEffect) -> u8 {
            match e {
                TaintEffect::NoSchedule => 0,
                TaintEffect::PreferNoSchedule => 1,
                TaintEffect::NoExecute => 2,
            }
        }
        rank(self).cmp(&rank(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TolerationOperator {
    /// Tolerates a taint with exactly this key and value.
    Equal,
    /// Tolerates any taint with this key.
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Toleration {
    pub key: String,
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
}

impl Toleration {
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Toleration {
            key: key.into(),
            operator: TolerationOperator::Equal,
            value: value.into(),
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Toleration {
            key: key.into(),
            operator: TolerationOperator::Exists,
            value: String::new(),
        }
    }

    pub fn tolerates(&self, taint: &Taint) -> bool {
        if self.key != taint.key {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => true,
            TolerationOperator::Equal => self.value == taint.value,
        }
    }
}

/// The first `NoSchedule`/`NoExecute` taint not covered by any toleration,
/// if one exists.
pub fn first_untolerated_taint<'a>(
    taints: impl IntoIterator<Item = &'a Taint>,
    tolerations: &[Toleration],
) -> Option<&'a Taint> {
    taints.into_iter().find(|taint| {
        taint.effect != TaintEffect::PreferNoSchedule
            && !tolerations.iter().any(|t| t.tolerates(taint))
    })
}

/// Exact-match label selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeSelector(pub BTreeMap<String, String>);

impl NodeSelector {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        NodeSelector(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the first unsatisfied label key, if any.
    pub fn unsatisfied_by<'a>(&'a self, labels: &BTreeMap<String, String>) -> Option<&'a str> {
        self.0
            .iter()
            .find(|(key, value)| labels.get(*key) != Some(value))
            .map(|(key, _)| key.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            LabelSelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            LabelSelectorOperator::NotIn => !value.is_some_and(|v| self.values.contains(v)),
            LabelSelectorOperator::Exists => value.is_some(),
            LabelSelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Hard node-affinity terms; all must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffinity {
    #[serde(default)]
    pub required: Vec<LabelSelector>,
}

impl NodeAffinity {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.required.iter().all(|term| term.matches(labels))
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }
}

/// A job currently bound to a node. The full job record is kept so an
/// evicted job can be re-queued with its placement requirements intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningJob {
    pub job: Job,
    /// Priority resolved from the job's class at bind time.
    pub priority: i32,
    pub preemptible: bool,
}

impl RunningJob {
    pub fn requests(&self) -> &ResourceList {
        &self.job.requests
    }

    pub fn gang_id(&self) -> Option<&str> {
        self.job.gang_id()
    }
}

/// A single compute node of some executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub executor_id: String,
    /// Identifier of the node's type (identical taints + indexed labels).
    /// Assigned by the node DB on upsert.
    #[serde(default)]
    pub node_type_id: String,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub total_resources: ResourceList,
    /// Effective capacity per priority: what a job at each priority may use,
    /// counting lower-priority usage as reclaimable. Layer `p` always
    /// dominates layer `p-1`.
    pub allocatable_by_priority: BTreeMap<i32, ResourceList>,
    pub running_jobs: BTreeMap<JobId, RunningJob>,
}

impl Node {
    /// A node with full capacity at every given priority and no jobs.
    pub fn new(
        id: impl Into<String>,
        executor_id: impl Into<String>,
        total_resources: ResourceList,
        priorities: &[i32],
    ) -> Self {
        let allocatable_by_priority = priorities
            .iter()
            .map(|p| (*p, total_resources.clone()))
            .collect();
        Node {
            id: id.into(),
            executor_id: executor_id.into(),
            node_type_id: String::new(),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            total_resources,
            allocatable_by_priority,
            running_jobs: BTreeMap::new(),
        }
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.labels = labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn with_taints(mut self, taints: Vec<Taint>) -> Self {
        self.taints = taints;
        self
    }

    pub fn allocatable_at(&self, priority: i32) -> ResourceList {
        self.allocatable_by_priority
            .get(&priority)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the sum of bound requests exceeds the node's capacity.
    pub fn is_oversubscribed(&self) -> bool {
        let mut bound = ResourceList::new();
        for running in self.running_jobs.values() {
            bound.add(running.requests());
        }
        !bound.fits_within(&self.total_resources)
    }

    /// Bound usage layered by job priority.
    pub fn allocated_by_priority(&self) -> ResourceListByPriority {
        let mut allocated = ResourceListByPriority::new();
        for running in self.running_jobs.values() {
            allocated.add_at(running.priority, running.requests());
        }
        allocated
    }
}
