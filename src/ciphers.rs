//! Cipher-suite and curve selection
//!
//! The tunnel speaks DTLS 1.2 with PSK cipher suites only. This module keeps
//! the canonical suite and curve tables, maps between wire identifiers and
//! the IANA-style names exposed on the command line, and parses the
//! colon-separated list syntax of the `-ciphers` and `-curves` flags.

use thiserror::Error;

use webrtc_dtls::cipher_suite::CipherSuiteId;
use webrtc_dtls::curve::named_curve::NamedCurve;

/// Parse failures for cipher and curve lists.
#[derive(Debug, Error)]
pub enum CipherListError {
    #[error("unknown ciphersuite: {0:?}")]
    UnknownCipher(String),

    #[error("unknown curve: {0:?}")]
    UnknownCurve(String),
}

/// Every PSK suite the tunnel supports, in preference order.
pub const FULL_CIPHER_LIST: &[CipherSuiteId] = &[
    CipherSuiteId::Tls_Ecdhe_Psk_With_Aes_128_Cbc_Sha256,
    CipherSuiteId::Tls_Psk_With_Aes_128_Ccm,
    CipherSuiteId::Tls_Psk_With_Aes_128_Ccm_8,
    CipherSuiteId::Tls_Psk_With_Aes_256_Ccm_8,
    CipherSuiteId::Tls_Psk_With_Aes_128_Gcm_Sha256,
    CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256,
];

/// Supported elliptic curves, in preference order.
pub const FULL_CURVE_LIST: &[NamedCurve] = &[NamedCurve::X25519, NamedCurve::P256, NamedCurve::P384];

/// IANA-style name for a supported suite.
#[must_use]
pub fn cipher_id_to_name(id: CipherSuiteId) -> &'static str {
    match id {
        CipherSuiteId::Tls_Ecdhe_Psk_With_Aes_128_Cbc_Sha256 => {
            "TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256"
        }
        CipherSuiteId::Tls_Psk_With_Aes_128_Ccm => "TLS_PSK_WITH_AES_128_CCM",
        CipherSuiteId::Tls_Psk_With_Aes_128_Ccm_8 => "TLS_PSK_WITH_AES_128_CCM_8",
        CipherSuiteId::Tls_Psk_With_Aes_256_Ccm_8 => "TLS_PSK_WITH_AES_256_CCM_8",
        CipherSuiteId::Tls_Psk_With_Aes_128_Gcm_Sha256 => "TLS_PSK_WITH_AES_128_GCM_SHA256",
        CipherSuiteId::Tls_Psk_With_Aes_128_Cbc_Sha256 => "TLS_PSK_WITH_AES_128_CBC_SHA256",
        _ => "UNSUPPORTED",
    }
}

/// Display name for a supported curve.
#[must_use]
pub fn curve_to_name(curve: NamedCurve) -> &'static str {
    match curve {
        NamedCurve::X25519 => "X25519",
        NamedCurve::P256 => "P-256",
        NamedCurve::P384 => "P-384",
        _ => "UNSUPPORTED",
    }
}

/// Render a suite list in `-ciphers` flag syntax.
#[must_use]
pub fn cipher_list_to_string(list: &[CipherSuiteId]) -> String {
    list.iter()
        .map(|&id| cipher_id_to_name(id))
        .collect::<Vec<_>>()
        .join(":")
}

/// Render a curve list in `-curves` flag syntax.
#[must_use]
pub fn curve_list_to_string(list: &[NamedCurve]) -> String {
    list.iter()
        .map(|&c| curve_to_name(c))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse a colon-separated suite list. An empty string yields an empty list,
/// which callers interpret as "use the full list".
pub fn parse_cipher_list(input: &str) -> Result<Vec<CipherSuiteId>, CipherListError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }
    input
        .split(':')
        .map(|name| {
            FULL_CIPHER_LIST
                .iter()
                .copied()
                .find(|&id| cipher_id_to_name(id) == name)
                .ok_or_else(|| CipherListError::UnknownCipher(name.to_string()))
        })
        .collect()
}

/// Parse a colon-separated curve list. Empty input yields an empty list.
pub fn parse_curve_list(input: &str) -> Result<Vec<NamedCurve>, CipherListError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }
    input
        .split(':')
        .map(|name| {
            FULL_CURVE_LIST
                .iter()
                .copied()
                .find(|&c| curve_to_name(c) == name)
                .ok_or_else(|| CipherListError::UnknownCurve(name.to_string()))
        })
        .collect()
}
