//! Deterministic client-id proof.
//!
//! The Hello request carries the client id both in clear and encrypted under
//! the token secret, proving the caller holds the secret without sending it.
//! The client id is exactly one AES block, so AES-CBC with a zero IV and no
//! padding reduces to a single raw block operation.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Encrypt a client id under the token secret.
///
/// Deterministic by design: the server recomputes it and compares.
pub fn encrypt_client_id(client_id: Uuid, secret: &[u8]) -> Result<[u8; 16]> {
    let cipher = cipher_for(secret)?;
    let mut block = (*client_id.as_bytes()).into();
    cipher.encrypt_block(&mut block);
    Ok(block.into())
}

/// Reverse [`encrypt_client_id`].
pub fn decrypt_client_id(encrypted: &[u8; 16], secret: &[u8]) -> Result<Uuid> {
    let cipher = cipher_for(secret)?;
    let mut block = (*encrypted).into();
    cipher.decrypt_block(&mut block);
    Ok(Uuid::from_bytes(block.into()))
}

fn cipher_for(secret: &[u8]) -> Result<Aes128> {
    // Token secrets are at least 16 bytes; the block cipher keys off the
    // first 16 so refreshed longer secrets stay compatible.
    let key: [u8; 16] = secret
        .get(..16)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::crypto("token secret shorter than 16 bytes"))?;
    Ok(Aes128::new(&key.into()))
}
