//! Client configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use webrtc_dtls::cipher_suite::CipherSuiteId;
use webrtc_dtls::curve::named_curve::NamedCurve;

use crate::addrgen::EndpointGen;
use crate::admission::{allow_all, AllowFn, TimeLimit};
use crate::ciphers;
use crate::keystore::Keystore;
use crate::tracker::StaleMode;

/// Default idle timeout applied when none is configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Default network-operation (dial + handshake) timeout.
pub const DEFAULT_NET_TIMEOUT: Duration = Duration::from_secs(10);

/// Default DTLS fragment MTU.
pub const DEFAULT_MTU: usize = 1400;

/// Everything a [`Client`](super::Client) needs to run.
///
/// Constructed with the required pieces; remaining fields have defaults and
/// are plain public for adjustment before [`Client::new`](super::Client::new)
/// consumes the config.
pub struct ClientConfig {
    /// Local plain-UDP bind address.
    pub bind_address: SocketAddr,
    /// Remote endpoint source, consulted freshly for every session.
    pub endpoints: Arc<dyn EndpointGen>,
    /// PSK lookup for the DTLS handshake.
    pub keystore: Arc<dyn Keystore>,
    /// PSK identity sent to the server.
    pub psk_identity: String,
    /// Dial and handshake deadline.
    pub timeout: Duration,
    /// Per-direction read deadline inside a session.
    pub idle_timeout: Duration,
    /// DTLS fragment MTU.
    pub mtu: usize,
    /// Offered cipher suites; empty means the full supported list.
    pub cipher_suites: Vec<CipherSuiteId>,
    /// Offered curves; empty means the full supported list.
    pub elliptic_curves: Vec<NamedCurve>,
    /// Which quiet side(s) make a session stale.
    pub stale_mode: StaleMode,
    /// Hard session duration limit, drawn once per session.
    pub time_limit: TimeLimit,
    /// Admission decision for new flows.
    pub allow: AllowFn,
    /// Offer the DTLS connection-ID extension (send-only).
    pub enable_cid: bool,
    /// Base cancellation scope; cancelling it shuts the client down.
    pub shutdown: CancellationToken,
}

impl ClientConfig {
    #[must_use]
    pub fn new(
        bind_address: SocketAddr,
        endpoints: Arc<dyn EndpointGen>,
        keystore: Arc<dyn Keystore>,
    ) -> Self {
        Self {
            bind_address,
            endpoints,
            keystore,
            psk_identity: String::new(),
            timeout: DEFAULT_NET_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            mtu: DEFAULT_MTU,
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
