//! ChaCha20-Poly1305 AEAD (RFC 8439) with explicit nonces.
//!
//! Callers almost always want [`crate::envelope`] instead, which frames the
//! nonce into the ciphertext blob. These functions exist for the rare case
//! where nonce handling is external.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::{CryptoError, Result};

/// Key size (256 bits).
pub const KEY_SIZE: usize = 32;

/// Nonce size (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;

/// Encrypt with an explicit nonce. The nonce must never be reused with the
/// same key.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Authentication)
}

/// Decrypt with an explicit nonce.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_with_aad() {
        let key = [0x42u8; KEY_SIZE];
        let nonce = [0x01u8; NONCE_SIZE];
        let ct = encrypt(&key, &nonce, b"hello mesh", b"aad").expect("encrypt");
        assert_eq!(ct.len(), b"hello mesh".len() + TAG_SIZE);
        let pt = decrypt(&key, &nonce, &ct, b"aad").expect("decrypt");
        assert_eq!(pt, b"hello mesh");
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = [0x42u8; KEY_SIZE];
        let nonce = [0x01u8; NONCE_SIZE];
        let ct = encrypt(&key, &nonce, b"hello", b"aad1").expect("encrypt");
        assert!(decrypt(&key, &nonce, &ct, b"aad2").is_err());
    }

    #[test]
    fn test_tampered_fails() {
        let key = [0x42u8; KEY_SIZE];
        let nonce = [0x01u8; NONCE_SIZE];
        let mut ct = encrypt(&key, &nonce, b"hello", b"").expect("encrypt");
        ct[0] ^= 0xFF;
        assert!(decrypt(&key, &nonce, &ct, b"").is_err());
    }
}
