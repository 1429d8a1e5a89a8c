//! Fan-out collector partitioning job events per organization.

use std::collections::HashMap;

use async_trait::async_trait;
use githoard_core::{Job, MetricsCollector};

use super::collector::Collector;
use crate::library::org_from_endpoint;

/// Bucket receiving failures that cannot be attributed to any organization
/// (a failed job carrying no endpoints).
pub const FALLBACK_ORG: &str = "unknown";

/// Routes every event to the collector of the organization owning each of
/// the job's endpoints. A job touching several organizations is split into
/// per-org jobs carrying only that organization's endpoints; endpoints of
/// unknown organizations are dropped.
///
/// Failures with no endpoints at all go to the fallback collector, so a
/// malformed job still counts as one failure, the same policy a standalone
/// [`Collector`] applies.
pub struct CollectorByOrg {
    collectors: HashMap<String, Collector>,
    fallback: Option<Collector>,
}

impl CollectorByOrg {
    pub fn new(collectors: HashMap<String, Collector>) -> Self {
        Self {
            collectors,
            fallback: None,
        }
    }

    /// Attach the collector receiving endpoint-less failures.
    pub fn with_fallback(mut self, collector: Collector) -> Self {
        self.fallback = Some(collector);
        self
    }

    fn all(&self) -> impl Iterator<Item = &Collector> {
        self.collectors.values().chain(self.fallback.as_ref())
    }
}

/// Split a job by the organization of each endpoint. Keys are lower-cased
/// to match how the sub-collectors are keyed; the endpoints themselves are
/// kept as given.
pub(crate) fn triage(job: &Job) -> HashMap<String, Job> {
    let mut per_org: HashMap<String, Job> = HashMap::new();

    for endpoint in &job.endpoints {
        let Some(org) = org_from_endpoint(endpoint).map(|org| org.to_lowercase()) else {
            continue;
        };

        per_org
            .entry(org)
            .or_insert_with(|| {
                let mut split = job.clone();
                split.endpoints = Vec::new();
                split
            })
            .endpoints
            .push(endpoint.clone());
    }

    per_org
}

#[async_trait]
impl MetricsCollector for CollectorByOrg {
    async fn start(&self) {
        for collector in self.all() {
            collector.start().await;
        }
    }

    async fn stop(&self, immediate: bool) {
        for collector in self.all() {
            collector.stop(immediate).await;
        }
    }

    async fn success(&self, job: Job) {
        for (org, split) in triage(&job) {
            if let Some(collector) = self.collectors.get(&org) {
                collector.success(split).await;
            }
        }
    }

    async fn fail(&self, job: Job) {
        let split = triage(&job);

        // No attributable endpoints: the failure still counts once.
        if split.is_empty() {
            if let Some(collector) = &self.fallback {
                collector.fail(job).await;
            }
            return;
        }

        for (org, split) in split {
            if let Some(collector) = self.collectors.get(&org) {
                collector.fail(split).await;
            }
        }
    }

    async fn discover(&self, job: Job) {
        for (org, split) in triage(&job) {
            if let Some(collector) = self.collectors.get(&org) {
                collector.discover(split).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::collector::CollectorConfig;
    use super::super::collector::test_sink::RecordingSink;
    use super::*;

    fn config() -> CollectorConfig {
        CollectorConfig {
            batch_size: 1,
            sync_time: Duration::from_secs(3600),
            ..CollectorConfig::default()
        }
    }

    fn fan_out(orgs: &[&str]) -> (CollectorByOrg, HashMap<String, Arc<RecordingSink>>) {
        let mut collectors = HashMap::new();
        let mut sinks = HashMap::new();
        for org in orgs {
            let sink = Arc::new(RecordingSink::default());
            collectors.insert(org.to_string(), Collector::new(*org, sink.clone(), config()));
            sinks.insert(org.to_string(), sink);
        }

        let fallback_sink = Arc::new(RecordingSink::default());
        let fallback = Collector::new(FALLBACK_ORG, fallback_sink.clone(), config());
        sinks.insert(FALLBACK_ORG.to_string(), fallback_sink);

        (CollectorByOrg::new(collectors).with_fallback(fallback), sinks)
    }

    #[test]
    fn triage_splits_endpoints_per_org() {
        let mut job = Job::update("loc-1", vec![]);
        job.endpoints = vec![
            "https://host/org1/repo-a".to_string(),
            "https://host/org2/repo-b".to_string(),
            "https://host/org1/repo-c".to_string(),
            "https://host".to_string(), // no org, dropped
        ];

        let split = triage(&job);
        assert_eq!(split.len(), 2);
        assert_eq!(
            split["org1"].endpoints,
            vec![
                "https://host/org1/repo-a".to_string(),
                "https://host/org1/repo-c".to_string(),
            ]
        );
        assert_eq!(
            split["org2"].endpoints,
            vec!["https://host/org2/repo-b".to_string()]
        );
    }

    #[test]
    fn triage_keys_are_lowercase() {
        let job = Job::download("https://github.com/PostHog/repo");
        let split = triage(&job);
        assert_eq!(split.len(), 1);
        assert_eq!(
            split["posthog"].endpoints,
            vec!["https://github.com/PostHog/repo".to_string()]
        );
    }

    #[tokio::test]
    async fn fan_out_is_order_independent_and_sums_to_the_total() {
        let orgs = ["org1", "org2", "org3"];
        let (by_org, sinks) = fan_out(&orgs);
        by_org.start().await;

        // 999 single-endpoint downloads spread evenly across three orgs.
        for i in 0..999 {
            let org = orgs[i % 3];
            by_org
                .success(Job::download(format!("https://host/{org}/repo-{i}")))
                .await;
        }
        by_org.stop(false).await;

        let mut total = 0;
        for org in orgs {
            let last = sinks[org].last().unwrap();
            assert_eq!(last.downloaded, 333, "{org}");
            total += last.downloaded;
        }
        assert_eq!(total, 999);
    }

    #[tokio::test]
    async fn org_case_from_the_endpoint_does_not_affect_routing() {
        let (by_org, sinks) = fan_out(&["org1"]);
        by_org.start().await;

        by_org
            .success(Job::download("https://github.com/Org1/repo"))
            .await;
        by_org.stop(false).await;

        assert_eq!(sinks["org1"].last().unwrap().downloaded, 1);
    }

    #[tokio::test]
    async fn endpointless_failures_count_once_in_the_fallback_bucket() {
        let (by_org, sinks) = fan_out(&["org1"]);
        by_org.start().await;

        by_org.fail(Job::update("loc-1", vec![])).await;
        by_org.stop(false).await;

        assert_eq!(sinks[FALLBACK_ORG].last().unwrap().failed, 1);
        assert!(sinks["org1"].last().is_none());
    }

    #[tokio::test]
    async fn events_for_unknown_orgs_are_dropped() {
        let (by_org, sinks) = fan_out(&["org1"]);
        by_org.start().await;

        by_org
            .success(Job::download("https://host/org1/repo"))
            .await;
        by_org
            .success(Job::download("https://host/other/repo"))
            .await;
        by_org.stop(false).await;

        assert_eq!(sinks["org1"].last().unwrap().downloaded, 1);
    }
}
