//! Per-source-IP admission rate limiting
//!
//! New sessions are admitted per source IP at a configured `N/D` rate: at
//! most N admissions within any sliding window of duration D. Each key keeps
//! an exact log of its recent admission instants, so the bound holds for
//! every window position, not just bucket boundaries.
//!
//! # Architecture
//!
//! ```text
//! allow(ip)
//!     |
//!     v
//! DashMap<IpAddr, Mutex<VecDeque<Instant>>>
//!     |        (expire hits older than D, admit if len < N)
//!     v
//! true / false
//! ```
//!
//! Keys are source IPs, never IP:port pairs, so a peer cannot widen its
//! budget by rotating source ports. The map is cleaned opportunistically:
//! once it grows past a threshold, keys whose whole log has expired are
//! dropped on the next `allow` call.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

/// Map size that triggers opportunistic cleanup of expired keys.
const CLEANUP_THRESHOLD: usize = 4096;

/// Errors from parsing the `N/D` limit syntax.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Missing `/` separator between count and window.
    #[error("rate limit spec {0:?} is not in <count>/<duration> form")]
    MissingSeparator(String),

    /// Count component did not parse or was zero.
    #[error("invalid rate limit count {0:?}")]
    InvalidCount(String),

    /// Window component did not parse or was zero.
    #[error("invalid rate limit window {0:?}: {1}")]
    InvalidWindow(String, humantime::DurationError),

    /// Zero-length window.
    #[error("rate limit window must be positive")]
    ZeroWindow,
}

/// Counters exposed for logging and tests.
#[derive(Debug, Default)]
pub struct RateLimiterStats {
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiterStats {
    #[must_use]
    pub fn allowed(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Sliding-window admission limiter keyed by source IP.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: DashMap<IpAddr, Mutex<VecDeque<Instant>>>,
    stats: RateLimiterStats,
}

impl RateLimiter {
    /// Create a limiter admitting at most `limit` sessions per `window`.
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: DashMap::new(),
            stats: RateLimiterStats::default(),
        }
    }

    /// Decide whether `key` may open another session right now.
    ///
    /// An admission is recorded only when the answer is `true`; rejected
    /// attempts do not consume budget.
    pub fn allow(&self, key: IpAddr) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: IpAddr, now: Instant) -> bool {
        if self.hits.len() > CLEANUP_THRESHOLD {
            self.cleanup_at(now);
        }
        let entry = self.hits.entry(key).or_insert_with(|| {
            Mutex::new(VecDeque::with_capacity(self.limit.min(64)))
        });
        let mut log = entry.lock();
        while let Some(&oldest) = log.front() {
            if now.duration_since(oldest) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }
        if log.len() < self.limit {
            log.push_back(now);
            self.stats.allowed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Drop keys whose entire admission log has aged out.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    fn cleanup_at(&self, now: Instant) {
        self.hits.retain(|_, log| {
            let log = log.lock();
            log.back()
                .is_some_and(|&last| now.duration_since(last) < self.window)
        });
    }

    /// Admission/rejection counters.
    #[must_use]
    pub fn stats(&self) -> &RateLimiterStats {
        &self.stats
    }

    /// Number of tracked source IPs.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.hits.len()
    }
}

impl std::fmt::Display for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            self.limit,
            humantime::format_duration(self.window)
        )
    }
}

impl FromStr for RateLimiter {
    type Err = RateLimitError;

    /// Parse `<count>/<duration>`, e.g. `20/1m` or `3/1s`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, window) = s
            .split_once('/')
            .ok_or_else(|| RateLimitError::MissingSeparator(s.to_string()))?;
        let limit: usize = count
            .parse()
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| RateLimitError::InvalidCount(count.to_string()))?;
        let window_dur = humantime::parse_duration(window)
            .map_err(|e| RateLimitError::InvalidWindow(window.to_string(), e))?;
        if window_dur.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }
        Ok(Self::new(limit, window_dur))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn admits_up_to_limit_within_window() {
        let rl = RateLimiter::new(3, Duration::from_secs(1));
        let now = Instant::now();
        let key = ip("192.0.2.7");
        assert!(rl.allow_at(key, now));
        assert!(rl.allow_at(key, now + Duration::from_millis(10)));
        assert!(rl.allow_at(key, now + Duration::from_millis(50)));
        assert!(!rl.allow_at(key, now + Duration::from_millis(90)));
        assert!(!rl.allow_at(key, now + Duration::from_millis(100)));
        assert_eq!(rl.stats().allowed(), 3);
        assert_eq!(rl.stats().rejected(), 2);
    }

    #[test]
    fn budget_returns_as_hits_age_out() {
        let rl = RateLimiter::new(2, Duration::from_secs(1));
        let now = Instant::now();
        let key = ip("192.0.2.8");
        assert!(rl.allow_at(key, now));
        assert!(rl.allow_at(key, now + Duration::from_millis(600)));
        assert!(!rl.allow_at(key, now + Duration::from_millis(900)));
        // First hit expires at +1s.
        assert!(rl.allow_at(key, now + Duration::from_millis(1100)));
        // Window [0.6s, 1.6s) holds two hits again.
        assert!(!rl.allow_at(key, now + Duration::from_millis(1500)));
    }

    #[test]
    fn no_window_of_duration_d_exceeds_the_limit() {
        let rl = RateLimiter::new(5, Duration::from_millis(100));
        let now = Instant::now();
        let key = ip("2001:db8::1");
        let mut admitted = Vec::new();
        // Hammer for one second at 1ms granularity.
        for ms in 0..1000u64 {
            let t = now + Duration::from_millis(ms);
            if rl.allow_at(key, t) {
                admitted.push(t);
            }
        }
        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&t| t.duration_since(start) < Duration::from_millis(100))
                .count();
            assert!(in_window <= 5, "window starting at hit {i} holds {in_window}");
        }
    }

    #[test]
    fn keys_have_independent_budgets() {
        let rl = RateLimiter::new(1, Duration::from_secs(1));
        let now = Instant::now();
        assert!(rl.allow_at(ip("192.0.2.1"), now));
        assert!(rl.allow_at(ip("192.0.2.2"), now));
        assert!(!rl.allow_at(ip("192.0.2.1"), now));
    }

    #[test]
    fn cleanup_drops_expired_keys() {
        let rl = RateLimiter::new(1, Duration::from_millis(50));
        let now = Instant::now();
        rl.allow_at(ip("192.0.2.1"), now);
        rl.allow_at(ip("192.0.2.2"), now);
        assert_eq!(rl.tracked_keys(), 2);
        rl.cleanup_at(now + Duration::from_millis(100));
        assert_eq!(rl.tracked_keys(), 0);
    }

    #[test]
    fn parses_and_displays_spec_syntax() {
        let rl: RateLimiter = "20/1m".parse().unwrap();
        assert_eq!(rl.to_string(), "20/1m");
        let rl: RateLimiter = "3/1s".parse().unwrap();
        assert_eq!(rl.limit, 3);
        assert_eq!(rl.window, Duration::from_secs(1));

        assert!("".parse::<RateLimiter>().is_err());
        assert!("20".parse::<RateLimiter>().is_err());
        assert!("0/1s".parse::<RateLimiter>().is_err());
        assert!("x/1s".parse::<RateLimiter>().is_err());
        assert!("5/xyz".parse::<RateLimiter>().is_err());
    }
}
