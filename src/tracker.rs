//! Session staleness tracking
//!
//! Each session runs two copy directions with per-read idle deadlines. When a
//! deadline fires the session must decide: was the side genuinely quiet since
//! the previous deadline, or did traffic race past the timer? The tracker
//! answers with four atomic counters and no locks:
//!
//! - `left_rx` / `right_rx` count successful reads per side.
//! - `left_timed_out_at` / `right_timed_out_at` snapshot the read counter at
//!   the moment that side's deadline last fired.
//!
//! A side is stale when its read counter still equals the snapshot, i.e. no
//! packet arrived since the previous expiry. Racing traffic advances the
//! counter past the snapshot and the session survives; the next expiry
//! re-snapshots. The configured [`StaleMode`] combines the two per-side
//! verdicts into the session-level decision.

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Which side(s) must be quiet before the session is considered stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleMode {
    /// Both sides quiet.
    Both,
    /// At least one side quiet.
    #[default]
    Either,
    /// Only the left (near) side matters.
    Left,
    /// Only the right (far) side matters.
    Right,
}

impl FromStr for StaleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "both" => Ok(Self::Both),
            "either" => Ok(Self::Either),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(format!("unknown stale mode: {other:?}")),
        }
    }
}

impl std::fmt::Display for StaleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Both => write!(f, "both"),
            Self::Either => write!(f, "either"),
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
        }
    }
}

/// One direction of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The near side: plain UDP on the client, DTLS on the server.
    Left,
    /// The far side.
    Right,
}

/// Per-session staleness tracker. See the module docs for the scheme.
#[derive(Debug)]
pub struct Tracker {
    mode: StaleMode,
    left_rx: AtomicU32,
    right_rx: AtomicU32,
    left_timed_out_at: AtomicU32,
    right_timed_out_at: AtomicU32,
}

impl Tracker {
    #[must_use]
    pub fn new(mode: StaleMode) -> Self {
        Self {
            mode,
            left_rx: AtomicU32::new(0),
            right_rx: AtomicU32::new(0),
            left_timed_out_at: AtomicU32::new(0),
            right_timed_out_at: AtomicU32::new(0),
        }
    }

    /// Record a successful read on `side`.
    pub fn notify(&self, side: Side) {
        match side {
            Side::Left => self.left_rx.fetch_add(1, Ordering::SeqCst),
            Side::Right => self.right_rx.fetch_add(1, Ordering::SeqCst),
        };
    }

    /// Record an idle-deadline expiry on `side` and decide the session's fate.
    ///
    /// Returns `true` when the session should continue (not stale under the
    /// configured mode), `false` when it must terminate.
    pub fn handle_timeout(&self, side: Side) -> bool {
        match side {
            Side::Left => self
                .left_timed_out_at
                .store(self.left_rx.load(Ordering::SeqCst), Ordering::SeqCst),
            Side::Right => self
                .right_timed_out_at
                .store(self.right_rx.load(Ordering::SeqCst), Ordering::SeqCst),
        }
        !self.is_stale()
    }

    fn left_stale(&self) -> bool {
        self.left_rx.load(Ordering::SeqCst) == self.left_timed_out_at.load(Ordering::SeqCst)
    }

    fn right_stale(&self) -> bool {
        self.right_rx.load(Ordering::SeqCst) == self.right_timed_out_at.load(Ordering::SeqCst)
    }

    fn is_stale(&self) -> bool {
        match self.mode {
            StaleMode::Both => self.left_stale() && self.right_stale(),
            StaleMode::Either => self.left_stale() || self.right_stale(),
            StaleMode::Left => self.left_stale(),
            StaleMode::Right => self.right_stale(),
        }
    }
}
