//! Cryptographic primitives for the sealed codec
//!
//! This module provides:
//! - ChaCha20-Poly1305 AEAD with counter nonces
//! - HKDF-SHA256 derivation of per-direction keys from a pre-shared key
//! - Secure random number generation

mod aead;
mod kdf;

pub use aead::Cipher;
pub use kdf::{derive_direction_key, Direction, Hkdf};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Length of the per-stream salt sent ahead of the first record
pub const SALT_LEN: usize = 32;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("Random generator failure")]
    Random,
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a fresh pre-shared key
pub fn generate_key() -> Result<[u8; KEY_LEN], CryptoError> {
    let mut key = [0u8; KEY_LEN];
    random_bytes(&mut key)?;
    Ok(key)
}

/// Decode a base64 pre-shared key
pub fn key_from_base64(s: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;

    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength)
}

/// Encode a pre-shared key as base64
pub fn key_to_base64(key: &[u8; KEY_LEN]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(key)
}
