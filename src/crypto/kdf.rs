//! Key derivation.
//!
//! The server issues a 128-bit session key at Hello; the UDP channel needs a
//! 256-bit ChaCha20-Poly1305 key. HKDF-SHA256 bridges the two so neither
//! endpoint ever uses the session key directly as cipher key material.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::{AeadKey, KEY_SIZE, SESSION_KEY_SIZE};

/// Expand the session key into the UDP-channel AEAD key.
///
/// Deterministic: both endpoints derive the same key from the session key
/// delivered in the Hello response.
pub fn expand_session_key(session_key: &[u8; SESSION_KEY_SIZE]) -> AeadKey {
    let hkdf = Hkdf::<Sha256>::new(Some(b"slipgate-v1"), session_key);
    let mut okm = [0u8; KEY_SIZE];
    // expand only fails when the output length exceeds 255 hash blocks
    hkdf.expand(b"udp-channel", &mut okm)
        .expect("32-byte HKDF expansion is always valid");
    AeadKey::from_bytes(okm)
}
