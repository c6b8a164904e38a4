//! Domain model for the stevedore batch scheduler.
//!
//! Everything here is plain data plus arithmetic: resource vectors, jobs and
//! gangs, priority classes, and nodes with their placement predicates. The
//! scheduling engine itself lives in `stevedore_scheduler`; interfaces to
//! external collaborators live in `stevedore_ports`.

pub mod error;
pub mod job;
pub mod node;
pub mod priority;
pub mod resources;

pub use error::SchedulingError;
pub use job::{GangDescriptor, Job, JobId};
pub use node::{
    first_untolerated_taint, LabelSelector, LabelSelectorOperator, Node, NodeAffinity,
    NodeSelector, RunningJob, Taint, TaintEffect, Toleration, TolerationOperator,
};
pub use priority::PriorityClass;
pub use resources::{Quantity, ResourceList, ResourceListByPriority};
