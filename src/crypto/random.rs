//! Random material for keys, ids and jitter.
//!
//! Everything comes from the OS entropy source. The datapath needs exactly
//! three shapes of randomness: fixed-size secret material (session keys,
//! token secrets, server keys), raw integers (NAT id bases, channel
//! lifespan jitter), and short printable ids for channels and requests.

use rand::RngCore;
use rand_core::OsRng;

/// OS-backed randomness, shaped for this crate's needs.
pub struct SecureRandom;

impl SecureRandom {
    /// Fixed-size array of random bytes (keys, secrets, ids).
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Random u64, used to jitter channel lifespans.
    pub fn u64() -> u64 {
        OsRng.next_u64()
    }

    /// Random u32, used to seed NAT id allocation.
    pub fn u32() -> u32 {
        OsRng.next_u32()
    }

    /// Short hex identifier for channels, workers and requests.
    pub fn short_id() -> String {
        hex::encode(Self::bytes::<6>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_not_constant() {
        let a: [u8; 16] = SecureRandom::bytes();
        let b: [u8; 16] = SecureRandom::bytes();

        assert!(!a.iter().all(|&x| x == 0));
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_id_shape() {
        let id = SecureRandom::short_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, SecureRandom::short_id());
    }
}
