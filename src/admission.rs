//! Session admission and duration limiting
//!
//! Two small policies applied at session start: an allow-function deciding
//! whether a new flow may become a session at all, and a time limit drawn
//! once per session that bounds how long the session may live regardless of
//! traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::randpool;
use crate::ratelimit::RateLimiter;

/// Admission decision for a new flow, keyed by the peer's address.
pub type AllowFn = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// An allow-function that admits everything.
#[must_use]
pub fn allow_all() -> AllowFn {
    Arc::new(|_| true)
}

/// Admission by per-source-IP rate limit.
///
/// The key is the source IP alone; the port is stripped so rotating source
/// ports does not widen the budget. `None` disables limiting entirely.
#[must_use]
pub fn allow_by_rate_limit(limiter: Option<Arc<RateLimiter>>) -> AllowFn {
    match limiter {
        None => allow_all(),
        Some(limiter) => Arc::new(move |peer: SocketAddr| limiter.allow(peer.ip())),
    }
}

/// Hard per-session duration limit, drawn once at session start.
///
/// A zero draw means "no limit". When the configured bounds differ, each
/// session draws uniformly from the half-open interval `[low, high)`;
/// reversed bounds are swapped, equal bounds give a constant.
#[derive(Debug, Clone, Copy)]
pub struct TimeLimit {
    low: Duration,
    high: Duration,
}

impl Default for TimeLimit {
    /// No session time limit.
    fn default() -> Self {
        Self::fixed(Duration::ZERO)
    }
}

impl TimeLimit {
    #[must_use]
    pub fn new(low: Duration, high: Duration) -> Self {
        if low > high {
            Self { low: high, high: low }
        } else {
            Self { low, high }
        }
    }

    #[must_use]
    pub const fn fixed(limit: Duration) -> Self {
        Self { low: limit, high: limit }
    }

    /// Draw this session's limit.
    #[must_use]
    pub fn draw(&self) -> Duration {
        if self.low == self.high {
            return self.low;
        }
        let delta = (self.high - self.low).as_nanos();
        let offset = randpool::borrow(|rng| rng.gen_range(0..delta));
        self.low + nanos_to_duration(offset)
    }
}

impl std::fmt::Display for TimeLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.low == self.high {
            write!(f, "{}", humantime::format_duration(self.low))
        } else {
            write!(
                f,
                "{}-{}",
                humantime::format_duration(self.low),
                humantime::format_duration(self.high)
            )
        }
    }
}

fn nanos_to_duration(nanos: u128) -> Duration {
    // u128 nanoseconds do not fit Duration::from_nanos directly.
    let secs = (nanos / 1_000_000_000) as u64;
    let subsec = (nanos % 1_000_000_000) as u32;
    Duration::new(secs, subsec)
}

/// Parse the `-time-limit` flag: a single duration for a fixed limit, or
/// `low-high` for a randomized one.
pub fn parse_time_limit(input: &str) -> Result<TimeLimit, humantime::DurationError> {
    match input.split_once('-') {
        None => Ok(TimeLimit::fixed(humantime::parse_duration(input)?)),
        Some((low, high)) => Ok(TimeLimit::new(
            humantime::parse_duration(low)?,
            humantime::parse_duration(high)?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn allow_all_admits_anything() {
        let allow = allow_all();
        assert!(allow("192.0.2.1:1234".parse().unwrap()));
        assert!(allow("[2001:db8::1]:9".parse().unwrap()));
    }

    #[test]
    fn missing_limiter_means_allow_all() {
        let allow = allow_by_rate_limit(None);
        for _ in 0..100 {
            assert!(allow("192.0.2.1:5000".parse().unwrap()));
        }
    }

    #[test]
    fn rate_limited_admission_is_keyed_by_ip_not_port() {
        let limiter = Arc::new(RateLimiter::new(2, Duration::from_secs(60)));
        let allow = allow_by_rate_limit(Some(limiter.clone()));
        assert!(allow("192.0.2.1:1000".parse().unwrap()));
        assert!(allow("192.0.2.1:2000".parse().unwrap()));
        // Third attempt from a new port still counts against the same IP.
        assert!(!allow("192.0.2.1:3000".parse().unwrap()));
        // Another IP has its own budget.
        assert!(allow("192.0.2.2:1000".parse().unwrap()));
        let key: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(!limiter.allow(key));
    }

    #[test]
    fn fixed_limit_draws_constant() {
        let tl = TimeLimit::fixed(Duration::from_millis(500));
        for _ in 0..10 {
            assert_eq!(tl.draw(), Duration::from_millis(500));
        }
    }

    #[test]
    fn zero_limit_means_unlimited() {
        assert_eq!(TimeLimit::default().draw(), Duration::ZERO);
    }

    #[test]
    fn ranged_draw_stays_in_half_open_interval() {
        let low = Duration::from_millis(100);
        let high = Duration::from_millis(200);
        let tl = TimeLimit::new(low, high);
        for _ in 0..1000 {
            let d = tl.draw();
            assert!(d >= low && d < high, "draw {d:?} outside [{low:?}, {high:?})");
        }
    }

    #[test]
    fn reversed_bounds_are_swapped() {
        let tl = TimeLimit::new(Duration::from_secs(2), Duration::from_secs(1));
        let d = tl.draw();
        assert!(d >= Duration::from_secs(1) && d < Duration::from_secs(2));
    }

    #[test]
    fn parses_single_and_ranged_forms() {
        let tl = parse_time_limit("500ms").unwrap();
        assert_eq!(tl.draw(), Duration::from_millis(500));

        let tl = parse_time_limit("1s-2s").unwrap();
        let d = tl.draw();
        assert!(d >= Duration::from_secs(1) && d < Duration::from_secs(2));

        assert!(parse_time_limit("abc").is_err());
    }
}
