//! Server configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use webrtc_dtls::cipher_suite::CipherSuiteId;
use webrtc_dtls::curve::named_curve::NamedCurve;

use crate::admission::{allow_all, AllowFn, TimeLimit};
use crate::ciphers;
use crate::client::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MTU, DEFAULT_NET_TIMEOUT};
use crate::keystore::Keystore;
use crate::tracker::StaleMode;

/// Everything a [`Server`](super::Server) needs to run.
pub struct ServerConfig {
    /// Local DTLS bind address.
    pub bind_address: SocketAddr,
    /// Fixed plain-UDP upstream each session forwards to.
    pub remote_address: String,
    /// PSK lookup for the DTLS handshake.
    pub keystore: Arc<dyn Keystore>,
    /// Handshake and upstream-dial deadline.
    pub timeout: Duration,
    /// Per-direction read deadline inside a session.
    pub idle_timeout: Duration,
    /// DTLS fragment MTU.
    pub mtu: usize,
    /// Skip the HelloVerifyRequest round (DPI workaround).
    pub skip_hello_verify: bool,
    /// Accepted cipher suites; empty means the full supported list.
    pub cipher_suites: Vec<CipherSuiteId>,
    /// Accepted curves; empty means the full supported list.
    pub elliptic_curves: Vec<NamedCurve>,
    /// Which quiet side(s) make a session stale.
    pub stale_mode: StaleMode,
    /// Hard session duration limit, drawn once per session.
    pub time_limit: TimeLimit,
    /// Admission decision for new flows, evaluated before the handshake.
    pub allow: AllowFn,
    /// Accept the DTLS connection-ID extension (send-only).
    pub enable_cid: bool,
    /// Base cancellation scope; cancelling it shuts the server down.
    pub shutdown: CancellationToken,
}

impl ServerConfig {
    #[must_use]
    pub fn new(
        bind_address: SocketAddr,
        remote_address: String,
        keystore: Arc<dyn Keystore>,
    ) -> Self {
        Self {
            bind_address,
            remote_address,
            keystore,
            timeout: DEFAULT_NET_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            mtu: DEFAULT_MTU,
            skip_hello_verify: false,
            cipher_suites: Vec::new(),
            elliptic_curves: Vec::new(),
            stale_mode: StaleMode::default(),
            time_limit: TimeLimit::default(),
            allow: allow_all(),
            enable_cid: false,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace zero/empty fields with their defaults.
    pub(super) fn populate_defaults(&mut self) {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_NET_TIMEOUT;
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        if self.mtu == 0 {
            self.mtu = DEFAULT_MTU;
        }
        if self.cipher_suites.is_empty() {
            self.cipher_suites = ciphers::FULL_CIPHER_LIST.to_vec();
        }
        if self.elliptic_curves.is_empty() {
            self.elliptic_curves = ciphers::FULL_CURVE_LIST.to_vec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::StaticKeystore;

    #[test]
    fn zero_fields_pick_up_defaults() {
        let mut cfg = ServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:5353".into(),
            Arc::new(StaticKeystore::new(b"k")),
        );
        cfg.timeout = Duration::ZERO;
        cfg.populate_defaults();
        assert_eq!(cfg.timeout, DEFAULT_NET_TIMEOUT);
        assert_eq!(cfg.cipher_suites, ciphers::FULL_CIPHER_LIST);
    }
}
