//! Job scheduling and worker pool engine for githoard.
//!
//! This crate holds the concurrency machinery that drives a repository
//! collection run:
//!
//! - [`Job`]: the unit of work, a flat struct tagged with [`JobKind`].
//! - [`JobScheduler`]: merges a download queue and an update queue into a
//!   single bounded outbound channel, assigning ids and enriching jobs on
//!   the way through.
//! - [`WorkerPool`]: a resizable set of workers consuming the outbound
//!   channel and reporting each job's outcome to a [`MetricsCollector`].
//! - [`Backoff`]: jittered exponential backoff shared by producers that
//!   need to slow down when a downstream stops accepting work.
//!
//! The repository plumbing itself (clone, fetch, storage layout) lives
//! behind the [`JobHandler`] trait and is provided by the application.

pub mod backoff;
pub mod job;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod test_support;
mod worker;

pub use backoff::Backoff;
pub use job::{AuthLookup, BoxError, Job, JobError, JobHandler, JobKind, JobOutcome, LocationId};
pub use metrics::{MetricsCollector, NoopCollector};
pub use pool::WorkerPool;
pub use scheduler::{EnrichFn, JobScheduler, SchedulerConfig};
