//! Fixed-window admission control keyed by source address.
//!
//! Node-local only. A background sweep drops windows that have been idle
//! for two window lengths so inactive keys do not accumulate.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Rejected; the current window closes after `retry_after`.
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

pub struct FixedWindowLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut windows = self.windows.lock();

        let Some(window) = windows.get_mut(key) else {
            windows.insert(
                key.to_string(),
                RateWindow {
                    count: 1,
                    window_start: now,
                },
            );
            return RateDecision::Allowed;
        };

        let elapsed = now.saturating_duration_since(window.window_start);
        if elapsed >= self.window {
            window.count = 1;
            window.window_start = now;
            return RateDecision::Allowed;
        }

        window.count = window.count.saturating_add(1);
        if window.count <= self.max_requests {
            RateDecision::Allowed
        } else {
            RateDecision::Limited {
                retry_after: self.window - elapsed,
            }
        }
    }

    /// Drop windows that started more than two window lengths ago.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let horizon = self.window * 2;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.window_start) <= horizon);
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    /// Sweep every two windows until the limiter is dropped or the handle aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        let period = self.window * 2;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, remaining = limiter.tracked_keys(), "Swept idle rate-limit windows");
                }
            }
        })
    }
}
