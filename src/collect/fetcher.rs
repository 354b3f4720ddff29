// src/collect/fetcher.rs
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};

use crate::collect::error::{FetchError, SourceError};
use crate::collect::rate_limit::RateLimiter;
use crate::collect::types::{Page, PageSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor)
    }
}

/// Why a fetch stopped before issuing its next upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    DeadlineReached,
    Superseded,
}

/// Consulted right before every upstream call, retries included.
pub type StopCheck<'a> = &'a (dyn Fn() -> Option<Halt> + Sync);

#[derive(Debug)]
pub enum Fetched {
    Page(Page),
    Halted(Halt),
}

/// Fetches pages through the shared rate limiter, retrying transient failures.
#[derive(Clone)]
pub struct PageFetcher {
    source: Arc<dyn PageSource>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl PageFetcher {
    pub fn new(source: Arc<dyn PageSource>, limiter: Arc<RateLimiter>, retry: RetryPolicy) -> Self {
        Self {
            source,
            limiter,
            retry,
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Fetch one page. `stop` is checked before waiting on the limiter and
    /// again once a slot is granted, so no call starts after it trips.
    pub async fn fetch_page(
        &self,
        code: &str,
        page_token: Option<&str>,
        stop: StopCheck<'_>,
    ) -> Result<Fetched, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            if let Some(h) = stop() {
                return Ok(Fetched::Halted(h));
            }
            self.limiter.acquire().await;
            if let Some(h) = stop() {
                tracing::debug!(target: "fetch", code, halt = ?h, "stopped while waiting for a rate slot");
                return Ok(Fetched::Halted(h));
            }
            attempt += 1;

            let t0 = std::time::Instant::now();
            let res = self.source.fetch_page(code, page_token).await;
            histogram!("collect_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

            match res {
                Ok(page) => return Ok(Fetched::Page(page)),
                Err(e) if e.is_transient() && attempt <= self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        target: "fetch",
                        code,
                        page = page_token.unwrap_or("1"),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient upstream failure, retrying"
                    );
                    counter!("collect_fetch_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(self.give_up(code, attempt, e)),
            }
        }
    }

    fn give_up(&self, code: &str, attempts: u32, cause: SourceError) -> FetchError {
        tracing::warn!(
            target: "fetch",
            code,
            attempts,
            source = self.source.name(),
            error = %cause,
            "giving up on page"
        );
        counter!("collect_fetch_errors_total").increment(1);
        FetchError {
            code: code.to_string(),
            attempts,
            cause,
        }
    }
}
