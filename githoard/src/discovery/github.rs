//! Iterator over the repositories of a GitHub organization.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, LINK, USER_AGENT};
use tracing::{debug, trace};

use super::{DiscoveryError, RepoIterator, RepoRecord};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RESULTS_PER_PAGE: u32 = 100;
const DEFAULT_WAIT_NEW_REPOS: Duration = Duration::from_secs(24 * 60 * 60);

/// One hour, the upper bound we trust on a rate-limit window.
const MAX_RATE_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone)]
pub struct GhRepoIterConfig {
    pub http_timeout: Duration,
    /// Records per page, clamped to the API maximum of 100.
    pub results_per_page: u32,
    /// Retry hint attached to the end-of-listing condition.
    pub wait_new_repos: Duration,
    pub auth_token: Option<String>,
    /// Overridable for GitHub Enterprise deployments and tests.
    pub api_base: String,
}

impl Default for GhRepoIterConfig {
    fn default() -> Self {
        Self {
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            results_per_page: DEFAULT_RESULTS_PER_PAGE,
            wait_new_repos: DEFAULT_WAIT_NEW_REPOS,
            auth_token: None,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

/// Pages through `/orgs/{org}/repos`, buffering each page and yielding one
/// record at a time.
///
/// When the upstream reports a short final page, a checkpoint remembers how
/// much of that page was already yielded; the next request re-fetches the
/// same page and skips the prefix, which is how additions to the tail of the
/// alphabetically stable listing are picked up without rescanning.
pub struct GhOrgRepoIter {
    org: String,
    excluded: HashSet<String>,
    client: reqwest::Client,
    api_base: String,
    auth_token: Option<String>,
    per_page: u32,
    page: u32,
    checkpoint: usize,
    buffer: VecDeque<RepoRecord>,
    wait_new_repos: Duration,
}

impl GhOrgRepoIter {
    pub fn new(org: impl Into<String>, excluded: &[String], config: GhRepoIterConfig) -> Self {
        let per_page = match config.results_per_page {
            0 | 101.. => DEFAULT_RESULTS_PER_PAGE,
            n => n,
        };

        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .unwrap_or_default();

        Self {
            org: org.into(),
            excluded: excluded.iter().cloned().collect(),
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            auth_token: config.auth_token,
            per_page,
            page: 1,
            checkpoint: 0,
            buffer: VecDeque::new(),
            wait_new_repos: config.wait_new_repos,
        }
    }

    async fn request_page(&mut self) -> Result<(), DiscoveryError> {
        let url = format!("{}/orgs/{}/repos", self.api_base, self.org);
        trace!(org = %self.org, page = self.page, "listing repositories");

        let mut request = self
            .client
            .get(&url)
            .query(&[("per_page", self.per_page), ("page", self.page)])
            .header(USER_AGENT, "githoard")
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.auth_token {
            request = request.header(AUTHORIZATION, format!("token {token}"));
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = rate_limit_retry_from_headers(response.headers());
            debug!(org = %self.org, ?retry_after, "rate limit exceeded");
            return Err(DiscoveryError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(DiscoveryError::Status { status, url });
        }

        let next_page = next_page_from_link(
            response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok()),
        );
        let repos: Vec<RepoRecord> = response.json().await?;

        self.integrate_page(repos, next_page)
    }

    /// Fold a fetched page into the buffer, maintaining the checkpoint.
    fn integrate_page(
        &mut self,
        repos: Vec<RepoRecord>,
        next_page: u32,
    ) -> Result<(), DiscoveryError> {
        let full_len = repos.len();

        let mut tail = repos;
        if self.checkpoint > 0 {
            let skip = if full_len < self.checkpoint {
                0
            } else {
                self.checkpoint
            };
            tail.drain(..skip);
        }

        if full_len < self.per_page as usize {
            self.checkpoint = full_len;
        }

        let outcome = if next_page == 0 {
            if full_len == self.per_page as usize {
                self.page += 1;
            }
            Err(DiscoveryError::NoNewRepos {
                retry_after: self.wait_new_repos,
            })
        } else {
            self.page = next_page;
            Ok(())
        };

        self.buffer.extend(tail);
        outcome
    }
}

#[async_trait]
impl RepoIterator for GhOrgRepoIter {
    async fn next(&mut self) -> Result<RepoRecord, DiscoveryError> {
        loop {
            if self.buffer.is_empty()
                && let Err(err) = self.request_page().await
                && self.buffer.is_empty()
            {
                return Err(err);
            }

            let Some(record) = self.buffer.pop_front() else {
                continue;
            };
            if !self.excluded.contains(&record.name) {
                return Ok(record);
            }
            trace!(repo = %record.name, "excluded repository skipped");
        }
    }
}

/// Time to wait before retrying after a rate-limit response, spreading the
/// remaining budget over the rest of the window: `(reset − now) /
/// (remaining + 1)`. A negative or over-one-hour window means the clock is
/// unreliable, so assume a full window with the full request budget.
fn rate_limit_retry(reset_epoch: i64, now_epoch: i64, remaining: i64, limit: i64) -> Duration {
    let mut window = reset_epoch - now_epoch;
    let mut requests = remaining;
    if window < 0 || window > MAX_RATE_WINDOW_SECS {
        window = MAX_RATE_WINDOW_SECS;
        requests = limit;
    }

    let secs = window / (requests.max(0) + 1);
    Duration::from_secs(secs.max(0) as u64)
}

fn rate_limit_retry_from_headers(headers: &HeaderMap) -> Duration {
    let reset = header_i64(headers, "x-ratelimit-reset");
    let remaining = header_i64(headers, "x-ratelimit-remaining");
    let limit = header_i64(headers, "x-ratelimit-limit");
    rate_limit_retry(reset, Utc::now().timestamp(), remaining, limit)
}

fn header_i64(headers: &HeaderMap, name: &str) -> i64 {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// The page number of the `rel="next"` link, 0 when there is none.
fn next_page_from_link(link: Option<&str>) -> u32 {
    let Some(link) = link else {
        return 0;
    };

    for part in link.split(',') {
        let mut sections = part.split(';');
        let Some(url_part) = sections.next() else {
            continue;
        };
        if !sections.any(|section| section.trim() == "rel=\"next\"") {
            continue;
        }

        let url = url_part.trim().trim_start_matches('<').trim_end_matches('>');
        let Some((_, query)) = url.split_once('?') else {
            continue;
        };
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("page=") {
                return value.parse().unwrap_or(0);
            }
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> RepoRecord {
        RepoRecord {
            name: name.to_string(),
            full_name: format!("org/{name}"),
            html_url: Some(format!("https://github.com/org/{name}")),
            ..RepoRecord::default()
        }
    }

    fn iter(per_page: u32, excluded: &[String]) -> GhOrgRepoIter {
        GhOrgRepoIter::new(
            "org",
            excluded,
            GhRepoIterConfig {
                results_per_page: per_page,
                ..GhRepoIterConfig::default()
            },
        )
    }

    #[test]
    fn full_page_advances_to_the_reported_next_page() {
        let mut it = iter(2, &[]);
        it.integrate_page(vec![record("a"), record("b")], 2).unwrap();
        assert_eq!(it.page, 2);
        assert_eq!(it.checkpoint, 0);
        assert_eq!(it.buffer.len(), 2);
    }

    #[test]
    fn short_final_page_checkpoints_its_length() {
        let mut it = iter(4, &[]);
        let err = it
            .integrate_page(vec![record("a"), record("b"), record("c")], 0)
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::NoNewRepos { .. }));
        assert_eq!(it.checkpoint, 3);
        assert_eq!(it.page, 1);
        assert_eq!(it.buffer.len(), 3);
    }

    #[test]
    fn refetched_page_skips_the_already_yielded_prefix() {
        let mut it = iter(4, &[]);
        let _ = it.integrate_page(vec![record("a"), record("b"), record("c")], 0);
        it.buffer.clear();

        // The same page now has one extra repository appended at the tail.
        let err = it
            .integrate_page(
                vec![record("a"), record("b"), record("c"), record("d")],
                0,
            )
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::NoNewRepos { .. }));

        let names: Vec<_> = it.buffer.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["d"]);
        // A now-full page moves pagination forward.
        assert_eq!(it.page, 2);
    }

    #[test]
    fn page_shorter_than_the_checkpoint_is_replayed_in_full() {
        let mut it = iter(4, &[]);
        let _ = it.integrate_page(vec![record("a"), record("b"), record("c")], 0);
        it.buffer.clear();

        let _ = it.integrate_page(vec![record("a"), record("b")], 0);
        assert_eq!(it.buffer.len(), 2);
        assert_eq!(it.checkpoint, 2);
    }

    #[tokio::test]
    async fn excluded_repositories_are_dropped_before_yielding() {
        let mut it = iter(4, &["skipme".to_string()]);
        it.buffer.push_back(record("skipme"));
        it.buffer.push_back(record("keepme"));

        let next = it.next().await.unwrap();
        assert_eq!(next.name, "keepme");
    }

    #[test]
    fn rate_limit_spreads_the_window_over_remaining_requests() {
        // 300 seconds left, 59 requests remaining: one request every 5s.
        assert_eq!(rate_limit_retry(1300, 1000, 59, 5000), Duration::from_secs(5));
    }

    #[test]
    fn unreliable_clock_falls_back_to_a_full_window() {
        // Reset in the past.
        assert_eq!(
            rate_limit_retry(900, 1000, 10, 5000),
            Duration::from_secs(3600 / 5001)
        );
        // Reset beyond one hour.
        assert_eq!(
            rate_limit_retry(1000 + 7200, 1000, 10, 59),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn next_page_comes_from_the_link_header() {
        assert_eq!(next_page_from_link(None), 0);
        assert_eq!(
            next_page_from_link(Some(
                "<https://api.github.com/organizations/1/repos?per_page=100&page=4>; rel=\"next\", \
                 <https://api.github.com/organizations/1/repos?per_page=100&page=9>; rel=\"last\""
            )),
            4
        );
        assert_eq!(
            next_page_from_link(Some(
                "<https://api.github.com/organizations/1/repos?page=1>; rel=\"prev\""
            )),
            0
        );
    }
}
