//! Per-client fixed-window request limiting for the HTTP edge.

use crate::config::RateLimitConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Windows are pruned once the table grows past this many clients.
const PRUNE_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Verdict for one request, with the values for the `RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the current window resets.
    pub reset_secs: u64,
}

pub(crate) struct RateLimiter {
    max_requests: u32,
    window: Duration,
    clients: Mutex<HashMap<IpAddr, Window>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub(crate) fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window: window.max(Duration::from_secs(1)),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// `None` when limiting is disabled.
    pub(crate) fn from_config(config: &RateLimitConfig) -> Option<Self> {
        config.enabled.then(|| {
            Self::new(
                config.max_requests,
                Duration::from_secs(config.window_secs),
            )
        })
    }

    pub(crate) fn check(&self, client: IpAddr) -> RateDecision {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: IpAddr, now: Instant) -> RateDecision {
        let mut clients = self.clients.lock().expect("rate limiter lock poisoned");

        if clients.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            clients.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = clients.entry(client).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        let allowed = entry.count < self.max_requests;
        if allowed {
            entry.count += 1;
        } else {
            debug!(client = %client, count = entry.count, "rate limit exceeded");
        }

        let elapsed = now.duration_since(entry.started);
        let reset = self.window.saturating_sub(elapsed);
        RateDecision {
            allowed,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(entry.count),
            reset_secs: reset.as_secs() + u64::from(reset.subsec_nanos() > 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        let remaining: Vec<u32> = (0..3).map(|_| limiter.check_at(A, now).remaining).collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = limiter.check_at(A, now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit, 3);
        assert_eq!(denied.reset_secs, 60);
    }

    #[test]
    fn clients_are_counted_separately() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check_at(A, now).allowed);
        assert!(!limiter.check_at(A, now).allowed);
        assert!(limiter.check_at(B, now).allowed);
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let now = Instant::now();
        assert!(limiter.check_at(A, now).allowed);

        let later = now + Duration::from_secs(4);
        let denied = limiter.check_at(A, later);
        assert!(!denied.allowed);
        assert_eq!(denied.reset_secs, 6);

        assert!(limiter.check_at(A, now + Duration::from_secs(10)).allowed);
    }

    #[test]
    fn disabled_config_builds_nothing() {
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        assert!(RateLimiter::from_config(&config).is_none());
        assert!(RateLimiter::from_config(&RateLimitConfig::default()).is_some());
    }
}
