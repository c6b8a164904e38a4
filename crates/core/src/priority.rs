//! Priority classes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::node::Toleration;

/// A named scheduling tier. The set of classes is fixed per scheduler
/// instance; jobs reference a class by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityClass {
    /// Numeric priority; higher schedules ahead and sees more node capacity.
    pub priority: i32,
    /// Whether jobs of this class may be evicted to make room.
    pub preemptible: bool,
    /// Per-queue cumulative usage cap at this class, as a fraction of total
    /// resources per resource name. Empty means uncapped.
    #[serde(default)]
    pub maximum_resource_fraction_per_queue: HashMap<String, f64>,
    /// Tolerations granted to every job of this class.
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

impl PriorityClass {
    pub fn new(priority: i32, preemptible: bool) -> Self {
        PriorityClass {
            priority,
            preemptible,
            maximum_resource_fraction_per_queue: HashMap::new(),
            tolerations: Vec::new(),
        }
    }

    pub fn with_queue_caps<I>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, f64)>,
    {
        self.maximum_resource_fraction_per_queue =
            caps.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        self
    }
}
