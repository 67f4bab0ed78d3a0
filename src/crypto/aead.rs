//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Uses ChaCha20-Poly1305 to seal UDP-channel datagrams. The cipher is fast
//! in software, constant-time, and widely deployed (TLS 1.3, WireGuard).

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes. Secret key material, handle with care.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// A nonce for AEAD operations, unique per datagram under one session key.
///
/// The UDP channel builds it from the monotonic datagram sequence and the
/// session id, so both endpoints derive the same nonce without carrying it
/// on the wire beyond the sequence number.
#[derive(Clone, Copy, Debug)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Nonce for a UDP-channel datagram: sequence (8 bytes BE), the direction
    /// flags, then the low 3 bytes of the session id. Both directions seal
    /// under the same key, so the flags byte keeps their nonces disjoint even
    /// at equal sequence numbers.
    pub fn for_datagram(seq: u64, session_id: u64, flags: u8) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&seq.to_be_bytes());
        nonce[8] = flags;
        nonce[9..].copy_from_slice(&(session_id as u32).to_be_bytes()[1..]);
        Self(nonce)
    }

    /// Create a nonce from raw bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// ChaCha20-Poly1305 AEAD cipher.
pub struct Aead {
    cipher: ChaCha20Poly1305,
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt plaintext; returns ciphertext with the 16-byte tag appended.
    ///
    /// `aad` is authenticated but not encrypted; the UDP channel passes the
    /// cleartext datagram header here so a tampered header fails to open.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        self.cipher
            .encrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::crypto("encryption failed"))
    }

    /// Decrypt ciphertext produced by [`Aead::encrypt`].
    ///
    /// Fails if the key, nonce or AAD do not match, or the data was tampered.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::invalid(format!(
                "sealed datagram too short: {} bytes",
                ciphertext.len()
            )));
        }

        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        self.cipher
            .decrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::crypto("decryption/authentication failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AeadKey {
        AeadKey::from_bytes([0x24u8; KEY_SIZE])
    }

    #[test]
    fn test_encrypt_decrypt() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::for_datagram(1, 99, 0);

        let ciphertext = aead.encrypt(&nonce, b"ip packet bytes", b"hdr").unwrap();
        assert_eq!(ciphertext.len(), b"ip packet bytes".len() + TAG_SIZE);

        let decrypted = aead.decrypt(&nonce, &ciphertext, b"hdr").unwrap();
        assert_eq!(decrypted, b"ip packet bytes");
    }

    #[test]
    fn test_datagram_nonce_distinct_per_seq() {
        let a = Nonce::for_datagram(1, 42, 0);
        let b = Nonce::for_datagram(2, 42, 0);
        let c = Nonce::for_datagram(1, 43, 0);
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::for_datagram(5, 7, 0);

        let ciphertext = aead.encrypt(&nonce, b"payload", b"header-a").unwrap();
        assert!(aead.decrypt(&nonce, &ciphertext, b"header-b").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::for_datagram(5, 7, 0);

        let mut ciphertext = aead.encrypt(&nonce, b"payload", b"").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(aead.decrypt(&nonce, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let aead = Aead::new(&test_key());
        let nonce = Nonce::for_datagram(0, 0, 0);
        assert!(aead.decrypt(&nonce, &[0u8; 4], b"").is_err());
    }
}
