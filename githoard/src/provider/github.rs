//! GitHub organization provider: discovered repositories become download
//! jobs on the scheduler's download queue.

use std::sync::Arc;

use async_trait::async_trait;
use githoard_core::Job;
use tokio::sync::mpsc;
use tracing::trace;

use crate::discovery::{
    AdvertiseError, DiscoveryConfig, GhOrgRepoIter, GhRepoIterConfig, OrgDiscovery, RepoRecord,
    RepoSink,
};

/// Advertise hook that turns records into download jobs, one endpoint each.
/// Records without a usable endpoint are skipped.
pub struct JobQueueSink {
    queue: mpsc::Sender<Job>,
}

impl JobQueueSink {
    pub fn new(queue: mpsc::Sender<Job>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl RepoSink for JobQueueSink {
    async fn advertise(&self, records: &[RepoRecord]) -> Result<(), AdvertiseError> {
        for record in records {
            let Ok(endpoint) = record.endpoint() else {
                trace!(repo = %record.name, "record without endpoint skipped");
                continue;
            };

            self.queue
                .send(Job::download(endpoint))
                .await
                .map_err(|_| AdvertiseError::QueueClosed)?;
        }
        Ok(())
    }
}

/// Build a discovery provider for one organization, wired to the download
/// queue.
pub fn github_org_discovery(
    org: &str,
    excluded_repos: &[String],
    auth_token: Option<String>,
    queue: mpsc::Sender<Job>,
    config: DiscoveryConfig,
) -> OrgDiscovery {
    let iter = GhOrgRepoIter::new(
        org,
        excluded_repos,
        GhRepoIterConfig {
            auth_token,
            ..GhRepoIterConfig::default()
        },
    );

    OrgDiscovery::new(Box::new(iter), Arc::new(JobQueueSink::new(queue)), config)
}
