//! Indexed, snapshot-consistent store of node state.
//!
//! Reads go through an atomically published immutable snapshot; writers
//! serialize on a mutex, clone the affected structures, and swap the root
//! pointer. Scheduling mutations run inside a transaction: a private
//! overlay of modified nodes on top of one snapshot, folded into the
//! published root on commit or dropped on abort.
//!
//! Placement queries walk per-priority B-tree indexes keyed by node type
//! and quantized free resources. Quantization rounds free resources down,
//! so any node an index seek returns has at least the key's resources:
//! jobs whose requests are multiples of the configured resolution are never
//! falsely rejected, while oddly sized jobs may get conservative no-fits.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use stevedore_core::{
    first_untolerated_taint, Job, JobId, Node, Quantity, ResourceList, RunningJob,
    SchedulingError, Taint, Toleration,
};
use tracing::debug;

use crate::config::{IndexedResource, SchedulingConfig};

/// A class of nodes with identical indexed taints and labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeType {
    pub id: String,
    pub taints: Vec<Taint>,
    pub labels: BTreeMap<String, String>,
}

/// One key in a per-priority index. Ordering is lexicographic over
/// (node type, quantized free resources, node id), which makes a seek from
/// the request vector skip everything that cannot fit on the first indexed
/// resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IndexEntry {
    node_type_id: String,
    quantized_free: Vec<Quantity>,
    node_id: String,
}

/// An immutable, consistent view of all nodes.
#[derive(Debug, Default, Clone)]
pub struct NodeDbSnapshot {
    nodes: BTreeMap<String, Arc<Node>>,
    node_types: BTreeMap<String, Arc<NodeType>>,
    indexes: BTreeMap<i32, BTreeSet<IndexEntry>>,
    total_resources: ResourceList,
}

impl NodeDbSnapshot {
    pub fn get_node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|k| k.as_str())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn total_resources(&self) -> &ResourceList {
        &self.total_resources
    }
}

/// Why a particular candidate node was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FitFailure {
    UntoleratedTaint { key: String },
    NodeSelectorMismatch { label: String },
    AffinityMismatch,
    AntiAffinityConflict { key: String },
    InsufficientResources { resource: String },
}

impl fmt::Display for FitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitFailure::UntoleratedTaint { key } => write!(f, "untolerated taint {key}"),
            FitFailure::NodeSelectorMismatch { label } => {
                write!(f, "node selector not satisfied on {label}")
            }
            FitFailure::AffinityMismatch => write!(f, "node affinity not satisfied"),
            FitFailure::AntiAffinityConflict { key } => {
                write!(f, "anti-affinity conflict on {key}")
            }
            FitFailure::InsufficientResources { resource } => {
                write!(f, "insufficient {resource}")
            }
        }
    }
}

/// Per-candidate rejection reasons of a failed placement, for reports.
/// Node types pruned before any node was examined are listed separately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoFitSummary {
    pub reasons_by_node: Vec<(String, FitFailure)>,
    pub excluded_node_types: Vec<(String, FitFailure)>,
}

impl fmt::Display for NoFitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reasons_by_node.is_empty() && self.excluded_node_types.is_empty() {
            return write!(f, "no candidate nodes");
        }
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for (_, failure) in &self.reasons_by_node {
            *counts.entry(failure.to_string()).or_default() += 1;
        }
        let mut first = true;
        for (reason, count) in counts {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{count} node(s): {reason}")?;
            first = false;
        }
        for (node_type, failure) in &self.excluded_node_types {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "node type {node_type}: {failure}")?;
            first = false;
        }
        Ok(())
    }
}

/// How good a fitting candidate is. Smaller residual wins, then fewer
/// induced preemptions; the caller breaks remaining ties on node id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeScore {
    pub residual: ResourceList,
    pub preemptions_induced: usize,
}

impl NodeScore {
    fn cmp(&self, other: &NodeScore) -> Ordering {
        self.residual
            .cmp_tightness(&other.residual)
            .then(self.preemptions_induced.cmp(&other.preemptions_induced))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSelection {
    pub node_id: String,
    pub score: NodeScore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    Selected(NodeSelection),
    NoFit(NoFitSummary),
}

/// The node database.
pub struct NodeDb {
    priorities: Vec<i32>,
    indexed_resources: Vec<IndexedResource>,
    indexed_taints: Vec<String>,
    indexed_labels: Vec<String>,
    max_extra_nodes_to_consider: usize,
    published: ArcSwap<NodeDbSnapshot>,
    write_lock: Mutex<()>,
}

impl NodeDb {
    pub fn new(config: &SchedulingConfig) -> Self {
        NodeDb {
            priorities: config.priorities(),
            indexed_resources: config.indexed_resources.clone(),
            indexed_taints: config.indexed_taints.clone(),
            indexed_labels: config.indexed_node_labels.clone(),
            max_extra_nodes_to_consider: config.max_extra_nodes_to_consider,
            published: ArcSwap::from_pointee(NodeDbSnapshot::default()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<NodeDbSnapshot> {
        self.published.load_full()
    }

    pub fn get_node(&self, id: &str) -> Option<Arc<Node>> {
        self.published.load().nodes.get(id).cloned()
    }

    pub fn total_resources(&self) -> ResourceList {
        self.published.load().total_resources.clone()
    }

    pub fn upsert(&self, node: Node) -> Result<(), SchedulingError> {
        self.upsert_many(vec![node])
    }

    /// Replace the state of the given nodes. In-flight snapshots keep
    /// seeing the previous versions.
    pub fn upsert_many(&self, nodes: Vec<Node>) -> Result<(), SchedulingError> {
        let _guard = self.write_lock.lock();
        let mut snapshot = (**self.published.load()).clone();
        for mut node in nodes {
            if node.id.is_empty() {
                return Err(SchedulingError::invalid_argument("node.id", "empty node id"));
            }
            if node.executor_id.is_empty() {
                return Err(SchedulingError::invalid_argument(
                    "node.executor_id",
                    "empty executor id",
                ));
            }
            self.normalize(&mut node);
            if let Some(previous) = snapshot.nodes.get(&node.id) {
                self.remove_index_entries(&mut snapshot.indexes, previous);
            }
            let node_type = self.node_type_for(&node);
            node.node_type_id = node_type.id.clone();
            snapshot
                .node_types
                .entry(node_type.id.clone())
                .or_insert_with(|| Arc::new(node_type));
            let node = Arc::new(node);
            self.add_index_entries(&mut snapshot.indexes, &node);
            snapshot.nodes.insert(node.id.clone(), node);
        }
        snapshot.total_resources = sum_totals(&snapshot.nodes);
        self.published.store(Arc::new(snapshot));
        Ok(())
    }

    /// Drop every node belonging to a timed-out executor. Returns how many
    /// nodes were purged.
    pub fn purge_executor(&self, executor_id: &str) -> usize {
        let _guard = self.write_lock.lock();
        let mut snapshot = (**self.published.load()).clone();
        let purged: Vec<Arc<Node>> = snapshot
            .nodes
            .values()
            .filter(|n| n.executor_id == executor_id)
            .cloned()
            .collect();
        for node in &purged {
            self.remove_index_entries(&mut snapshot.indexes, node);
            snapshot.nodes.remove(&node.id);
        }
        snapshot.total_resources = sum_totals(&snapshot.nodes);
        self.published.store(Arc::new(snapshot));
        purged.len()
    }

    /// Begin a transaction overlaying the current snapshot.
    pub fn txn(&self) -> NodeDbTxn<'_> {
        NodeDbTxn {
            db: self,
            base: self.snapshot(),
            overlay: BTreeMap::new(),
            indexes: None,
        }
    }

    /// Fill in what an executor's report may omit: allocatable layers for
    /// every configured priority, reduced by the jobs already running.
    fn normalize(&self, node: &mut Node) {
        if node.allocatable_by_priority.is_empty() {
            for p in &self.priorities {
                node.allocatable_by_priority
                    .insert(*p, node.total_resources.clone());
            }
            recompute_allocatable(node);
        } else {
            for p in &self.priorities {
                node.allocatable_by_priority
                    .entry(*p)
                    .or_insert_with(|| node.total_resources.clone());
            }
        }
    }

    fn node_type_for(&self, node: &Node) -> NodeType {
        let mut taints: Vec<Taint> = node
            .taints
            .iter()
            .filter(|t| self.indexed_taints.iter().any(|k| *k == t.key))
            .cloned()
            .collect();
        taints.sort();
        let labels: BTreeMap<String, String> = self
            .indexed_labels
            .iter()
            .filter_map(|k| node.labels.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let mut id = String::new();
        for taint in &taints {
            id.push_str(&format!("t:{}={:?};", taint.key, taint.effect));
        }
        for (key, value) in &labels {
            id.push_str(&format!("l:{key}={value};"));
        }
        if id.is_empty() {
            id.push_str("untyped");
        }
        NodeType { id, taints, labels }
    }

    fn index_key(&self, node: &Node, priority: i32) -> Vec<Quantity> {
        let allocatable = node.allocatable_at(priority);
        self.indexed_resources
            .iter()
            .map(|r| allocatable.get(&r.name).quantize_down(r.resolution))
            .collect()
    }

    fn add_index_entries(&self, indexes: &mut BTreeMap<i32, BTreeSet<IndexEntry>>, node: &Node) {
        for p in &self.priorities {
            indexes.entry(*p).or_default().insert(IndexEntry {
                node_type_id: node.node_type_id.clone(),
                quantized_free: self.index_key(node, *p),
                node_id: node.id.clone(),
            });
        }
    }

    fn remove_index_entries(&self, indexes: &mut BTreeMap<i32, BTreeSet<IndexEntry>>, node: &Node) {
        for p in &self.priorities {
            if let Some(index) = indexes.get_mut(p) {
                index.remove(&IndexEntry {
                    node_type_id: node.node_type_id.clone(),
                    quantized_free: self.index_key(node, *p),
                    node_id: node.id.clone(),
                });
            }
        }
    }
}

/// A restore point inside a transaction.
pub struct TxnCheckpoint {
    overlay: BTreeMap<String, Arc<Node>>,
    indexes: Option<BTreeMap<i32, BTreeSet<IndexEntry>>>,
}

/// A mutable overlay over one snapshot. Dropping the transaction discards
/// all of its changes.
///
/// Bindings keep the transaction's own copy of the indexes current, so
/// selection inside the transaction sees nodes at their reduced (and
/// re-quantized) free resources.
pub struct NodeDbTxn<'db> {
    db: &'db NodeDb,
    base: Arc<NodeDbSnapshot>,
    overlay: BTreeMap<String, Arc<Node>>,
    /// Lazily cloned from the base snapshot on first mutation.
    indexes: Option<BTreeMap<i32, BTreeSet<IndexEntry>>>,
}

impl<'db> NodeDbTxn<'db> {
    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.overlay.get(id).or_else(|| self.base.nodes.get(id))
    }

    /// All nodes, overlay state winning over the base snapshot.
    pub fn iter_nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.base
            .nodes
            .iter()
            .map(|(id, node)| self.overlay.get(id).unwrap_or(node))
    }

    fn indexes(&self) -> &BTreeMap<i32, BTreeSet<IndexEntry>> {
        self.indexes.as_ref().unwrap_or(&self.base.indexes)
    }

    fn reindex(&mut self, old_node: &Node, new_node: &Node) {
        if self.indexes.is_none() {
            self.indexes = Some(self.base.indexes.clone());
        }
        if let Some(indexes) = self.indexes.as_mut() {
            self.db.remove_index_entries(indexes, old_node);
            self.db.add_index_entries(indexes, new_node);
        }
    }

    pub fn checkpoint(&self) -> TxnCheckpoint {
        TxnCheckpoint {
            overlay: self.overlay.clone(),
            indexes: self.indexes.clone(),
        }
    }

    pub fn rollback_to(&mut self, checkpoint: TxnCheckpoint) {
        self.overlay = checkpoint.overlay;
        self.indexes = checkpoint.indexes;
    }

    /// Find the best node for `job` at `priority`, examining candidates in
    /// index order: after the first exact fit, at most
    /// `max_extra_nodes_to_consider` further candidates are checked.
    pub fn select_node_for_job(
        &self,
        job: &Job,
        priority: i32,
        class_tolerations: &[Toleration],
    ) -> SelectionOutcome {
        let mut tolerations = job.tolerations.clone();
        tolerations.extend_from_slice(class_tolerations);

        let request_key: Vec<Quantity> = self
            .db
            .indexed_resources
            .iter()
            .map(|r| job.requests.get(&r.name))
            .collect();

        let empty = BTreeSet::new();
        let index = self.indexes().get(&priority).unwrap_or(&empty);

        let mut reasons: Vec<(String, FitFailure)> = Vec::new();
        let mut excluded_node_types: Vec<(String, FitFailure)> = Vec::new();
        let mut best: Option<NodeSelection> = None;
        let mut extra_considered = 0usize;

        'types: for node_type in self.base.node_types.values() {
            if let Some(taint) = first_untolerated_taint(&node_type.taints, &tolerations) {
                debug!(node_type = %node_type.id, taint = %taint.key, "node type excluded");
                excluded_node_types.push((
                    node_type.id.clone(),
                    FitFailure::UntoleratedTaint {
                        key: taint.key.clone(),
                    },
                ));
                continue;
            }
            if let Some(label) = node_type_selector_conflict(node_type, job) {
                excluded_node_types.push((
                    node_type.id.clone(),
                    FitFailure::NodeSelectorMismatch {
                        label: label.to_string(),
                    },
                ));
                continue;
            }
            let lower = IndexEntry {
                node_type_id: node_type.id.clone(),
                quantized_free: request_key.clone(),
                node_id: String::new(),
            };
            for entry in index.range(lower..) {
                if entry.node_type_id != node_type.id {
                    break;
                }
                if best.is_some() {
                    extra_considered += 1;
                    if extra_considered > self.db.max_extra_nodes_to_consider {
                        break 'types;
                    }
                }
                let Some(node) = self.node(&entry.node_id) else {
                    continue;
                };
                match self.exact_fit(node, job, priority, &tolerations) {
                    Ok(score) => {
                        let better = match &best {
                            None => true,
                            Some(current) => match score.cmp(&current.score) {
                                Ordering::Less => true,
                                Ordering::Greater => false,
                                Ordering::Equal => entry.node_id < current.node_id,
                            },
                        };
                        if better {
                            best = Some(NodeSelection {
                                node_id: entry.node_id.clone(),
                                score,
                            });
                        }
                    }
                    Err(failure) => reasons.push((entry.node_id.clone(), failure)),
                }
            }
        }

        match best {
            Some(selection) => SelectionOutcome::Selected(selection),
            None => SelectionOutcome::NoFit(NoFitSummary {
                reasons_by_node: reasons,
                excluded_node_types,
            }),
        }
    }

    /// Bind `job` to `node_id`: subtract its requests from every
    /// allocatable layer at or below `priority` and record the running job.
    pub fn bind_job(
        &mut self,
        job: &Job,
        priority: i32,
        preemptible: bool,
        node_id: &str,
    ) -> Result<(), SchedulingError> {
        let old_node = self
            .node(node_id)
            .ok_or_else(|| {
                SchedulingError::invalid_argument("node_id", format!("unknown node {node_id}"))
            })?
            .clone();
        let mut node = (*old_node).clone();
        for (layer_priority, layer) in node.allocatable_by_priority.iter_mut() {
            if *layer_priority <= priority {
                layer.checked_sub(&job.requests)?;
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
        self.reindex(&old_node, &node);
        self.overlay.insert(node_id.to_string(), Arc::new(node));
        Ok(())
    }

    /// Reverse a binding, returning the released job record.
    pub fn unbind_job(
        &mut self,
        node_id: &str,
        job_id: JobId,
    ) -> Result<RunningJob, SchedulingError> {
        let old_node = self
            .node(node_id)
            .ok_or_else(|| {
                SchedulingError::invalid_argument("node_id", format!("unknown node {node_id}"))
            })?
            .clone();
        let mut node = (*old_node).clone();
        let released = node.running_jobs.remove(&job_id).ok_or_else(|| {
            SchedulingError::invalid_argument(
                "job_id",
                format!("job {job_id} is not running on node {node_id}"),
            )
        })?;
        // Recompute rather than add back: on an oversubscribed node the
        // layers were clamped at zero, and incremental restoration would
        // invent capacity that is still occupied.
        recompute_allocatable(&mut node);
        self.reindex(&old_node, &node);
        self.overlay.insert(node_id.to_string(), Arc::new(node));
        Ok(released)
    }

    /// Atomically publish all changes made in this transaction.
    pub fn commit(self) -> Result<(), SchedulingError> {
        if self.overlay.is_empty() {
            return Ok(());
        }
        let _guard = self.db.write_lock.lock();
        let mut snapshot = (**self.db.published.load()).clone();
        for (node_id, node) in self.overlay {
            if let Some(previous) = snapshot.nodes.get(&node_id) {
                self.db
                    .remove_index_entries(&mut snapshot.indexes, previous);
            }
            self.db.add_index_entries(&mut snapshot.indexes, &node);
            snapshot.nodes.insert(node_id, node);
        }
        snapshot.total_resources = sum_totals(&snapshot.nodes);
        self.db.published.store(Arc::new(snapshot));
        Ok(())
    }

    fn exact_fit(
        &self,
        node: &Node,
        job: &Job,
        priority: i32,
        tolerations: &[Toleration],
    ) -> Result<NodeScore, FitFailure> {
        if let Some(taint) = first_untolerated_taint(&node.taints, tolerations) {
            return Err(FitFailure::UntoleratedTaint {
                key: taint.key.clone(),
            });
        }
        if let Some(label) = job.node_selector.unsatisfied_by(&node.labels) {
            return Err(FitFailure::NodeSelectorMismatch {
                label: label.to_string(),
            });
        }
        if !job.affinity.matches(&node.labels) {
            return Err(FitFailure::AffinityMismatch);
        }
        for (key, value) in &job.anti_affinity_labels {
            let conflict = node
                .running_jobs
                .values()
                .any(|running| running.job.anti_affinity_labels.get(key) == Some(value));
            if conflict {
                return Err(FitFailure::AntiAffinityConflict { key: key.clone() });
            }
        }
        let allocatable = node.allocatable_at(priority);
        if let Some((resource, _)) = job
            .requests
            .iter()
            .find(|(resource, quantity)| *quantity > allocatable.get(resource))
        {
            return Err(FitFailure::InsufficientResources {
                resource: resource.to_string(),
            });
        }
        let mut residual = allocatable;
        residual.saturating_sub(&job.requests);
        Ok(NodeScore {
            residual,
            preemptions_induced: preemptions_induced(node, job, priority),
        })
    }
}

/// How many running jobs would have to be evicted for `job` to fit without
/// relying on priority headroom.
fn preemptions_induced(node: &Node, job: &Job, priority: i32) -> usize {
    let mut free = node.total_resources.clone();
    for running in node.running_jobs.values() {
        free.saturating_sub(running.requests());
    }
    if job.requests.fits_within(&free) {
        return 0;
    }
    let mut evictable: Vec<&RunningJob> = node
        .running_jobs
        .values()
        .filter(|r| r.preemptible && r.priority < priority)
        .collect();
    evictable.sort_by_key(|r| r.priority);
    let mut count = 0;
    for running in evictable {
        free.add(running.requests());
        count += 1;
        if job.requests.fits_within(&free) {
            break;
        }
    }
    count
}

/// The first selector label whose value the node type contradicts.
/// Unindexed labels cannot be judged at type level and are left to the
/// exact check.
fn node_type_selector_conflict<'a>(node_type: &NodeType, job: &'a Job) -> Option<&'a str> {
    job.node_selector
        .0
        .iter()
        .find(|(key, value)| {
            node_type
                .labels
                .get(*key)
                .is_some_and(|node_value| node_value != *value)
        })
        .map(|(key, _)| key.as_str())
}

/// Reset every allocatable layer to total minus the requests of running
/// jobs at or above that layer's priority.
fn recompute_allocatable(node: &mut Node) {
    let priorities: Vec<i32> = node.allocatable_by_priority.keys().copied().collect();
    for priority in priorities {
        let mut layer = node.total_resources.clone();
        for running in node.running_jobs.values() {
            if running.priority >= priority {
                layer.saturating_sub(running.requests());
            }
        }
        node.allocatable_by_priority.insert(priority, layer);
    }
}

fn sum_totals(nodes: &BTreeMap<String, Arc<Node>>) -> ResourceList {
    let mut total = ResourceList::new();
    for node in nodes.values() {
        total.add(&node.total_resources);
    }
    total
}
