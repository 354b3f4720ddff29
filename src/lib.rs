// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod assignment;
pub mod collect;
pub mod config;
pub mod metrics;
pub mod publish;
pub mod scheduler;
pub mod upstream;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::assignment::{AssignmentSource, FileAssignmentSource, HttpAssignmentSource};
use crate::collect::epoch::{EpochTracker, SystemClock};
use crate::collect::fetcher::PageFetcher;
use crate::collect::rate_limit::RateLimiter;
use crate::collect::types::PageSource;
use crate::collect::Collector;
use crate::config::{AgentConfig, AssignmentKind, PublishKind, UpstreamKind};
use crate::publish::{DirectorySink, HttpObjectSink, ResultSink};
use crate::scheduler::{EpochRunner, LastResultStore};
use crate::upstream::{FixtureSource, RedfinGisSource};

pub use crate::api::router;

/// Everything the binary needs, wired from config.
pub struct Agent {
    pub runner: EpochRunner,
    pub assignments: Arc<dyn AssignmentSource>,
    pub state: api::AppState,
}

/// Build limiter, upstream, collector, sink and assignment source from `cfg`.
/// Every upstream call (page fetches and lookups) shares the one limiter.
pub fn build_agent(cfg: &AgentConfig) -> Result<Agent> {
    let limiter = Arc::new(RateLimiter::new(cfg.rate_limit.calls, cfg.rate_window()));

    let source: Arc<dyn PageSource> = match cfg.upstream.kind {
        UpstreamKind::Redfin => Arc::new(RedfinGisSource::new(cfg.redfin_cfg(), limiter.clone())?),
        UpstreamKind::Fixture => {
            let path = cfg
                .upstream
                .fixture_path
                .as_deref()
                .ok_or_else(|| anyhow!("upstream.kind = fixture needs upstream.fixture_path"))?;
            Arc::new(FixtureSource::from_path(path)?)
        }
    };

    let tracker = Arc::new(EpochTracker::new());
    let fetcher = PageFetcher::new(source, limiter, cfg.retry_policy());
    let collector = Arc::new(Collector::new(
        fetcher,
        tracker.clone(),
        Arc::new(SystemClock),
        cfg.collector_cfg(),
    ));

    let sink: Arc<dyn ResultSink> = match cfg.publish.kind {
        PublishKind::Http => {
            let endpoint = cfg
                .publish
                .endpoint
                .clone()
                .context("publish.kind = http needs publish.endpoint")?;
            Arc::new(
                HttpObjectSink::new(endpoint)
                    .with_prefix(cfg.publish.prefix.clone())
                    .with_token(cfg.publish.token.clone())
                    .with_timeout(cfg.publish.timeout_secs)
                    .with_attempts(cfg.publish.max_attempts),
            )
        }
        PublishKind::Directory => Arc::new(DirectorySink::new(cfg.publish.dir.clone())),
    };

    let assignments: Arc<dyn AssignmentSource> = match cfg.assignment.kind {
        AssignmentKind::Http => {
            let url = cfg
                .assignment
                .url
                .clone()
                .context("assignment.kind = http needs assignment.url")?;
            Arc::new(HttpAssignmentSource::new(url, cfg.assignment.token.clone())?)
        }
        AssignmentKind::File => {
            let path = cfg
                .assignment
                .path
                .clone()
                .context("assignment.kind = file needs assignment.path")?;
            Arc::new(FileAssignmentSource::new(path))
        }
    };

    let last = LastResultStore::new();
    let runner = EpochRunner::new(collector, sink, last.clone());
    Ok(Agent {
        runner,
        assignments,
        state: api::AppState { tracker, last },
    })
}
