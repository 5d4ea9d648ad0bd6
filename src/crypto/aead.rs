//! ChaCha20-Poly1305 record sealing
//!
//! Both ends of a direction count records, so nonces are never sent on the
//! wire; a record that is dropped or reordered fails authentication.

use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// AEAD cipher for one direction of a stream
pub struct Cipher {
    key: LessSafeKey,
    nonce_counter: u64,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key = UnboundKey::new(&CHACHA20_POLY1305, key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            nonce_counter: 0,
        })
    }

    /// Seal `buffer` in place, appending the auth tag
    pub fn seal(&mut self, buffer: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = Nonce::assume_unique_for_key(self.next_nonce()?);

        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), buffer)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))
    }

    /// Open `buffer` (ciphertext + tag) in place, returning the plaintext
    pub fn open<'a>(&mut self, buffer: &'a mut [u8]) -> Result<&'a mut [u8], CryptoError> {
        if buffer.len() < TAG_LEN {
            return Err(CryptoError::Decryption("record shorter than tag".to_string()));
        }

        let nonce = Nonce::assume_unique_for_key(self.next_nonce()?);

        self.key
            .open_in_place(nonce, Aad::empty(), buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))
    }

    /// Generate the next nonce (monotonic counter)
    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], CryptoError> {
        if self.needs_rekey() {
            return Err(CryptoError::Encryption("nonce space exhausted".to_string()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        Ok(nonce)
    }

    /// Get current nonce counter value
    pub fn nonce_counter(&self) -> u64 {
        self.nonce_counter
    }

    /// Check if rekey is needed (after 2^32 records)
    pub fn needs_rekey(&self) -> bool {
        self.nonce_counter >= (1u64 << 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = [0x42u8; KEY_LEN];
        let mut sealer = Cipher::new(&key).unwrap();
        let mut opener = Cipher::new(&key).unwrap();

        let mut first = b"Hello".to_vec();
        let mut second = b"World".to_vec();
        sealer.seal(&mut first).unwrap();
        sealer.seal(&mut second).unwrap();
        assert_eq!(first.len(), 5 + TAG_LEN);

        assert_eq!(opener.open(&mut first).unwrap(), b"Hello");
        assert_eq!(opener.open(&mut second).unwrap(), b"World");
        assert_eq!(opener.nonce_counter(), 2);
    }

    #[test]
    fn test_out_of_order_record_rejected() {
        let key = [0x42u8; KEY_LEN];
        let mut sealer = Cipher::new(&key).unwrap();
        let mut opener = Cipher::new(&key).unwrap();

        let mut first = b"one".to_vec();
        let mut second = b"two".to_vec();
        sealer.seal(&mut first).unwrap();
        sealer.seal(&mut second).unwrap();

        assert!(opener.open(&mut second).is_err());
    }

    #[test]
    fn test_tamper_detection() {
        let key = [0x42u8; KEY_LEN];
        let mut sealer = Cipher::new(&key).unwrap();
        let mut opener = Cipher::new(&key).unwrap();

        let mut record = b"Hello, World!".to_vec();
        sealer.seal(&mut record).unwrap();
        record[0] ^= 0xFF;

        assert!(opener.open(&mut record).is_err());
    }
}
