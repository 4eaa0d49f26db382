//! Windowed rate limiter shared by every request to one upstream source
//!
//! Each upstream publishes a ceiling of N requests per window (for example
//! 5,000 per hour). The limiter keeps the grant instants of the trailing
//! window, so no interval of one window length ever contains more than
//! `limit` grants, regardless of how many workers call in concurrently.
//!
//! Blocking callers queue on a fair (FIFO) async mutex and the caller at the
//! head waits for the next opening while holding it, so permission is handed
//! out strictly in arrival order. The budget itself sits behind a second lock
//! that is only held to check and record a grant, never across a sleep.

use crate::error::{IngestError, IngestResult};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Pacer};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Snapshot of the budget of the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    /// Start of the current window
    pub window_start: Instant,
    /// Grants within the trailing window
    pub count: u32,
    /// Effective limit for the current window
    pub limit: u32,
    pub window_duration: Duration,
}

struct LimiterState {
    grants: VecDeque<Instant>,
    limit: u32,
    /// Limit staged by `set_limit`, applied at the next window boundary
    pending_limit: Option<u32>,
    window_start: Instant,
}

impl LimiterState {
    /// Advance the window boundary past `now` and drop expired grants
    fn roll(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            let elapsed = now.duration_since(self.window_start);
            let windows = (elapsed.as_nanos() / window.as_nanos().max(1)) as u32;
            self.window_start += window * windows;

            if let Some(limit) = self.pending_limit.take() {
                tracing::info!(old = self.limit, new = limit, "Rate limit change applied at window boundary");
                self.limit = limit;
            }
        }

        while let Some(oldest) = self.grants.front() {
            if now.duration_since(*oldest) >= window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    /// Earliest instant at which one more grant could fit
    fn next_opening(&self, window: Duration) -> Instant {
        let len = self.grants.len();
        let limit = self.limit as usize;
        // grants[len - limit] is the grant whose expiry brings the count below limit
        let expiry = self.grants[len - limit] + window;

        match self.pending_limit {
            Some(_) => expiry.min(self.window_start + window),
            None => expiry,
        }
    }
}

/// Rate limiter for one upstream source
pub struct RateLimiter {
    name: String,
    window: Duration,
    /// Admission queue for `acquire`; the holder is the next caller served
    queue: Mutex<()>,
    state: Mutex<LimiterState>,
    /// Wakes the queue head when a limit change is staged
    limit_changed: Notify,
    pacer: Option<Pacer<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimiter {
    /// Create a limiter allowing `limit` grants per `window`
    pub fn new(name: impl Into<String>, limit: NonZeroU32, window: Duration) -> Self {
        Self {
            name: name.into(),
            window,
            queue: Mutex::new(()),
            state: Mutex::new(LimiterState {
                grants: VecDeque::with_capacity(limit.get() as usize),
                limit: limit.get(),
                pending_limit: None,
                window_start: Instant::now(),
            }),
            limit_changed: Notify::new(),
            pacer: None,
        }
    }

    /// Also require at least `interval` between two consecutive grants
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        if let Some(quota) = Quota::with_period(interval) {
            self.pacer = Some(Pacer::direct(quota));
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait for permission to send one request, returning the grant instant
    ///
    /// Returns `Cancelled` if `cancel` fires while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> IngestResult<Instant> {
        let _turn = tokio::select! {
            guard = self.queue.lock() => guard,
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
        };

        if let Some(pacer) = &self.pacer {
            tokio::select! {
                _ = pacer.until_ready() => {}
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            }
        }

        loop {
            let (proceed_at, changed) = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.roll(now, self.window);

                if (state.grants.len() as u32) < state.limit {
                    state.grants.push_back(now);
                    return Ok(now);
                }

                let proceed_at = state.next_opening(self.window);
                tracing::debug!(
                    limiter = %self.name,
                    wait_ms = proceed_at.saturating_duration_since(now).as_millis() as u64,
                    count = state.grants.len(),
                    limit = state.limit,
                    "Rate limit reached, waiting for window to open"
                );
                // Registered before the state lock is released so no change is missed
                (proceed_at, self.limit_changed.notified())
            };

            tokio::select! {
                _ = tokio::time::sleep_until(proceed_at) => {}
                _ = changed => {}
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            }
        }
    }

    /// Take a grant without waiting
    ///
    /// `Err(delay)` tells the caller how long to suspend before asking again.
    /// Pacing is not applied here; it only throttles blocking callers.
    pub async fn try_acquire(&self) -> Result<Instant, Duration> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.roll(now, self.window);

        if (state.grants.len() as u32) < state.limit {
            state.grants.push_back(now);
            Ok(now)
        } else {
            Err(state.next_opening(self.window).saturating_duration_since(now))
        }
    }

    /// Stage a new limit; it takes effect at the next window boundary
    ///
    /// Grants already handed out in the current window stay valid even if
    /// the new limit is lower.
    pub async fn set_limit(&self, limit: NonZeroU32) {
        {
            let mut state = self.state.lock().await;
            if limit.get() == state.limit {
                state.pending_limit = None;
            } else {
                state.pending_limit = Some(limit.get());
            }
        }
        self.limit_changed.notify_waiters();
    }

    /// Current budget, after expiring stale grants
    pub async fn budget(&self) -> RateBudget {
        let mut state = self.state.lock().await;
        state.roll(Instant::now(), self.window);
        RateBudget {
            window_start: state.window_start,
            count: state.grants.len() as u32,
            limit: state.limit,
            window_duration: self.window,
        }
    }
}
