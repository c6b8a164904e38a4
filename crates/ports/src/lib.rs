//! Narrow interfaces between the stevedore scheduling core and its external
//! collaborators: the persistent job store, the event bus, leader election,
//! and the executor lease API. Implementations live outside the core; tests
//! use in-memory mocks.

pub mod event_publisher;
pub mod executor_api;
pub mod job_repository;
pub mod leader;

pub use event_publisher::{EventPublisher, EventPublisherError, EventSequence, JobRunEvent};
pub use executor_api::{JobRunLease, LeaseRequest, LeaseResponse};
pub use job_repository::{JobRepository, JobRepositoryError};
pub use leader::{LeaderController, LeaderToken, StandaloneLeaderController};
