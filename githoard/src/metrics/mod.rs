//! Per-organization metrics collection and its PostgreSQL sink.

pub mod by_org;
pub mod collector;
pub mod db;

pub use by_org::{CollectorByOrg, FALLBACK_ORG};
pub use collector::{Collector, CollectorConfig, MetricCounts, MetricsSink, SinkError};
pub use db::{DbSink, prepare_db};
