//! Jobs and gangs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::SchedulingError;
use crate::node::{NodeAffinity, NodeSelector, Toleration};
use crate::resources::ResourceList;

/// Job ids are ULIDs: time-ordered, so lexicographic order is submission
/// order.
pub type JobId = Ulid;

/// A set of jobs that schedules atomically. A singleton job is a gang of
/// cardinality 1 with no descriptor.
///
/// The descriptor is computed once at ingestion from the configured
/// annotations and stored on the job; the hot loop never re-parses
/// annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GangDescriptor {
    pub id: String,
    pub cardinality: usize,
}

impl GangDescriptor {
    /// Extract a descriptor from submission annotations, if present.
    ///
    /// A gang id without a cardinality, or a cardinality that is not a
    /// positive integer, is a malformed job.
    pub fn from_annotations(
        job_id: JobId,
        annotations: &BTreeMap<String, String>,
        gang_id_annotation: &str,
        gang_cardinality_annotation: &str,
    ) -> Result<Option<GangDescriptor>, SchedulingError> {
        let Some(gang_id) = annotations.get(gang_id_annotation) else {
            return Ok(None);
        };
        let malformed = |message: String| SchedulingError::MalformedJob {
            job_id: job_id.to_string(),
            message,
        };
        if gang_id.is_empty() {
            return Err(malformed(format!("annotation {gang_id_annotation} is empty")));
        }
        let cardinality = annotations
            .get(gang_cardinality_annotation)
            .ok_or_else(|| malformed(format!("gang job missing {gang_cardinality_annotation}")))?;
        let cardinality: usize = cardinality
            .parse()
            .map_err(|_| malformed(format!("invalid gang cardinality {cardinality:?}")))?;
        if cardinality == 0 {
            return Err(malformed("gang cardinality must be positive".to_string()));
        }
        Ok(Some(GangDescriptor {
            id: gang_id.clone(),
            cardinality,
        }))
    }
}

/// A queued batch job as the scheduler sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// The job set this job's lifecycle events are keyed by.
    pub job_set: String,
    /// Name of the job's priority class.
    pub priority_class: String,
    pub requests: ResourceList,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub node_selector: NodeSelector,
    #[serde(default)]
    pub affinity: NodeAffinity,
    /// Label values enforcing pod anti-affinity: two jobs sharing a value
    /// for the same key refuse to share a node.
    #[serde(default)]
    pub anti_affinity_labels: BTreeMap<String, String>,
    pub gang: Option<GangDescriptor>,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn gang_id(&self) -> Option<&str> {
        self.gang.as_ref().map(|g| g.id.as_str())
    }

    pub fn gang_cardinality(&self) -> usize {
        self.gang.as_ref().map(|g| g.cardinality).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GANG_ID: &str = "stevedore.io/gang-id";
    const GANG_CARDINALITY: &str = "stevedore.io/gang-cardinality";

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_no_gang_annotations() {
        let descriptor = GangDescriptor::from_annotations(
            Ulid::nil(),
            &annotations(&[]),
            GANG_ID,
            GANG_CARDINALITY,
        )
        .unwrap();
        assert!(descriptor.is_none());
    }

    #[test]
    fn test_valid_gang_annotations() {
        let descriptor = GangDescriptor::from_annotations(
            Ulid::nil(),
            &annotations(&[(GANG_ID, "gang-7"), (GANG_CARDINALITY, "3")]),
            GANG_ID,
            GANG_CARDINALITY,
        )
        .unwrap()
        .unwrap();
        assert_eq!(descriptor.id, "gang-7");
        assert_eq!(descriptor.cardinality, 3);
    }

    #[test]
    fn test_malformed_gang_annotations() {
        for pairs in [
            vec![(GANG_ID, "gang-7")],
            vec![(GANG_ID, "gang-7"), (GANG_CARDINALITY, "zero")],
            vec![(GANG_ID, "gang-7"), (GANG_CARDINALITY, "0")],
            vec![(GANG_ID, ""), (GANG_CARDINALITY, "2")],
        ] {
            let result = GangDescriptor::from_annotations(
                Ulid::nil(),
                &annotations(&pairs),
                GANG_ID,
                GANG_CARDINALITY,
            );
            assert!(matches!(result, Err(SchedulingError::MalformedJob { .. })), "{pairs:?}");
        }
    }
}
