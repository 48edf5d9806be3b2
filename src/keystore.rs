//! Pre-shared key material
//!
//! DTLS-PSK cipher suites authenticate both ends with a shared symmetric key.
//! This module generates keys, converts them to and from the hex form used on
//! the command line and in the `DTLSPIPE_PSK` environment variable, and
//! resolves identity hints to key bytes during the handshake.
//!
//! The handshake layer calls [`Keystore::psk_for_hint`] with whatever
//! identity hint the peer presented. The returned buffer is owned by the
//! caller; implementations must hand out copies so later mutation of their
//! internal state cannot reach in-flight handshakes.

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Largest PSK we will generate, in bytes.
pub const MAX_PSK_LENGTH: usize = 64;

/// Errors from key generation and hint resolution.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Requested key length is zero or above [`MAX_PSK_LENGTH`].
    #[error("invalid PSK length {0}: must be in 1..={MAX_PSK_LENGTH}")]
    InvalidLength(usize),

    /// The hex string on the CLI or in the environment did not decode.
    #[error("PSK hex decoding failed: {0}")]
    BadHex(#[from] hex::FromHexError),

    /// No key available for the presented identity hint.
    #[error("no key for identity hint")]
    UnknownHint,
}

/// Generate a random PSK of `length` bytes from the OS entropy source.
pub fn gen_psk(length: usize) -> Result<Vec<u8>, KeystoreError> {
    if length == 0 || length > MAX_PSK_LENGTH {
        return Err(KeystoreError::InvalidLength(length));
    }
    let mut key = vec![0u8; length];
    OsRng.fill_bytes(&mut key);
    Ok(key)
}

/// Generate a random PSK and return it hex-encoded.
pub fn gen_psk_hex(length: usize) -> Result<String, KeystoreError> {
    Ok(hex::encode(gen_psk(length)?))
}

/// Decode a hex-encoded PSK.
pub fn psk_from_hex(input: &str) -> Result<Vec<u8>, KeystoreError> {
    Ok(hex::decode(input)?)
}

/// Maps a peer's PSK identity hint to key bytes.
pub trait Keystore: Send + Sync {
    /// Resolve `hint` to a key. Returns an owned copy.
    fn psk_for_hint(&self, hint: &[u8]) -> Result<Vec<u8>, KeystoreError>;
}

/// A keystore holding exactly one key, handed out for every hint.
pub struct StaticKeystore {
    psk: Vec<u8>,
}

impl StaticKeystore {
    #[must_use]
    pub fn new(psk: &[u8]) -> Self {
        Self { psk: psk.to_vec() }
    }
}

impl Keystore for StaticKeystore {
    fn psk_for_hint(&self, _hint: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        Ok(self.psk.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip_preserves_key() {
        for len in [1, 16, 32, MAX_PSK_LENGTH] {
            let encoded = gen_psk_hex(len).unwrap();
            let decoded = psk_from_hex(&encoded).unwrap();
            assert_eq!(decoded.len(), len);
            assert_eq!(hex::encode(&decoded), encoded);
        }
    }

    #[test]
    fn rejects_out_of_range_lengths() {
        assert!(matches!(gen_psk(0), Err(KeystoreError::InvalidLength(0))));
        assert!(matches!(
            gen_psk(MAX_PSK_LENGTH + 1),
            Err(KeystoreError::InvalidLength(_))
        ));
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(psk_from_hex("zz").is_err());
        assert!(psk_from_hex("abc").is_err());
    }

    #[test]
    fn static_keystore_hands_out_copies() {
        let store = StaticKeystore::new(b"super secret");
        let a = store.psk_for_hint(b"hint-a").unwrap();
        let b = store.psk_for_hint(b"").unwrap();
        assert_eq!(a, b"super secret");
        assert_eq!(a, b);
    }

    #[test]
    fn generated_keys_differ() {
        let a = gen_psk(16).unwrap();
        let b = gen_psk(16).unwrap();
        assert_ne!(a, b);
    }
}
