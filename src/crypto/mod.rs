//! Cryptographic primitives for the slipgate core.
//!
//! This module provides:
//! - ChaCha20-Poly1305 AEAD sealing for the UDP channel
//! - HKDF expansion of the 128-bit session key into AEAD key material
//! - The deterministic client-id proof (single-block AES under the token secret)
//! - Secure random number generation
//!
//! Key exchange is not done here: the server chooses the session key at
//! Hello and delivers it over the TLS-protected control stream.

mod aead;
mod client_id;
mod kdf;
mod random;

pub use aead::{Aead, AeadKey, Nonce};
pub use client_id::{decrypt_client_id, encrypt_client_id};
pub use kdf::expand_session_key;
pub use random::SecureRandom;

/// Size of expanded AEAD keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of the session key chosen by the server at Hello (128 bits)
pub const SESSION_KEY_SIZE: usize = 16;
