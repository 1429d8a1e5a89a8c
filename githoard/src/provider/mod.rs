//! Job providers feeding the scheduler's source queues.

pub mod github;
pub mod updates;

pub use github::{JobQueueSink, github_org_discovery};
pub use updates::{UpdatesConfig, UpdatesError, UpdatesProvider, UpdatesStopper};
