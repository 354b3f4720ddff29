//! # Rate Limiter
//! Sliding-window budget for upstream calls (default 20 per minute).
//!
//! Every grant is stamped; a new grant is allowed only while fewer than
//! `calls` stamps fall inside the trailing window. Waiters queue on a fair
//! `tokio::sync::Mutex`, so slots are handed out in request order.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Budget {
    calls: u32,
    window: Duration,
}

#[derive(Debug)]
pub struct RateLimiter {
    budget: Option<Budget>,
    /// Grant instants inside the current window, oldest first.
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// `calls == 0` or a zero window disables limiting.
    pub fn new(calls: u32, window: Duration) -> Self {
        let budget = if calls == 0 || window.is_zero() {
            None
        } else {
            Some(Budget { calls, window })
        };
        Self {
            budget,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(calls: u32) -> Self {
        Self::new(calls, Duration::from_secs(60))
    }

    /// Pass-through limiter for tests and local runs.
    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Suspend until a call slot is free, then claim it.
    pub async fn acquire(&self) {
        let Some(budget) = self.budget else {
            return;
        };

        // Holding the lock while sleeping keeps later callers queued behind us.
        let mut issued = self.issued.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&t) = issued.front() {
                if now.duration_since(t) >= budget.window {
                    issued.pop_front();
                } else {
                    break;
                }
            }

            if issued.len() < budget.calls as usize {
                issued.push_back(now);
                return;
            }

            match issued.front() {
                Some(&oldest) => {
                    tracing::debug!(
                        target: "fetch",
                        wait_ms = (oldest + budget.window).saturating_duration_since(now).as_millis() as u64,
                        "rate budget exhausted, waiting"
                    );
                    sleep_until(oldest + budget.window).await;
                }
                None => return,
            }
        }
    }
}
