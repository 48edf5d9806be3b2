//! Error types for dtlspipe
//!
//! Each subsystem defines its own error enum next to its code; this module
//! rolls them up for callers that hold a whole client or server, and tags
//! every category with a recovery hint. Per-session failures never surface
//! here: sessions log and die locally. What does surface is fatal at the
//! orchestrator level (bad configuration, listener breakdown).

use std::io;

use thiserror::Error;

use crate::addrgen::EndpointError;
use crate::ciphers::CipherListError;
use crate::dialer::DialError;
use crate::keystore::KeystoreError;
use crate::listener::ListenerError;
use crate::ratelimit::RateLimitError;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum DtlsPipeError {
    /// Invalid flag values, endpoint specs, PSK material, bind addresses.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener failed to start or broke down permanently.
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    /// I/O errors not covered elsewhere.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DtlsPipeError {
    /// Check if the process can keep running after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Listener(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Startup configuration failures. Always fatal, reported with exit code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Bind address did not parse as `ip:port`.
    #[error("can't parse bind address {0:?}")]
    BadBindAddress(String),

    /// Endpoint group specification was malformed.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// PSK missing or malformed.
    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    /// No PSK given at all.
    #[error("no -psk option provided and {0} environment variable is not set")]
    MissingPsk(&'static str),

    /// Cipher or curve list did not parse.
    #[error(transparent)]
    CipherList(#[from] CipherListError),

    /// Rate limit specification did not parse.
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// Duration flag did not parse.
    #[error("invalid duration {flag} {value:?}: {source}")]
    BadDuration {
        flag: &'static str,
        value: String,
        source: humantime::DurationError,
    },
}

impl ConfigError {
    /// Configuration problems need operator intervention, never a retry.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Per-session failures, logged by the session that hit them.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Remote dial failed.
    #[error("remote dial failed: {0}")]
    Dial(#[from] DialError),

    /// DTLS handshake failed.
    #[error("DTLS handshake failed: {0}")]
    Handshake(String),

    /// Dial or handshake exceeded the network-operation timeout.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl SessionError {
    /// Session errors end one session; the orchestrator carries on.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}
