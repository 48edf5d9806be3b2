//! dtlspipe: bidirectional UDP-over-DTLS tunnel
//!
//! Wraps arbitrary UDP datagrams in DTLS 1.2 with pre-shared-key cipher
//! suites. The client accepts plain UDP locally and forwards each flow over
//! DTLS to a server, which unwraps and relays to a fixed upstream. A hopping
//! client variant re-samples the remote endpoint per session from weighted
//! address ranges to frustrate endpoint blocking.
//!
//! # Architecture
//!
//! ```text
//! sender → client listener → [admission] → session → DTLS → server
//!                                                             |
//!                              upstream ← plain UDP ← session ┘
//! ```
//!
//! Each session is an independent cancellation scope running the packet
//! pump: two copy directions with idle deadlines routed through a stale
//! tracker, plus a watchdog tying the session to process shutdown and its
//! optional hard time limit.
//!
//! # Modules
//!
//! - [`addrgen`]: weighted endpoint generation for the hopping client
//! - [`admission`]: allow-functions and session time limits
//! - [`ciphers`]: supported cipher-suite and curve tables
//! - [`client`] / [`server`]: the two session orchestrators
//! - [`dialer`]: per-session remote dialing with fresh DNS
//! - [`error`]: top-level error hierarchy
//! - [`keystore`]: PSK generation, hex codec and hint resolution
//! - [`listener`]: UDP flow-demultiplexing listener
//! - [`pump`]: the bidirectional packet pump
//! - [`randpool`]: per-thread seeded PRNG checkout
//! - [`ratelimit`]: per-source-IP sliding-window limiter
//! - [`tracker`]: session staleness tracking

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod addrgen;
pub mod admission;
pub mod ciphers;
pub mod client;
pub mod dialer;
pub mod error;
pub mod keystore;
pub mod listener;
pub mod pump;
pub mod randpool;
pub mod ratelimit;
pub mod server;
pub mod tracker;

pub use addrgen::{AddrSet, EndpointGen, EqualMultiEndpointGen, SingleEndpoint};
pub use admission::{allow_all, allow_by_rate_limit, AllowFn, TimeLimit};
pub use client::{Client, ClientConfig};
pub use error::{ConfigError, DtlsPipeError, SessionError};
pub use keystore::{gen_psk_hex, psk_from_hex, Keystore, StaticKeystore};
pub use pump::{pair_conn, MAX_PKT_BUF};
pub use ratelimit::RateLimiter;
pub use server::{Server, ServerConfig};
pub use tracker::{Side, StaleMode, Tracker};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable consulted for the hex PSK when `-psk` is absent.
pub const PSK_ENV_VAR: &str = "DTLSPIPE_PSK";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
