//! Self-contained ciphertext blobs.
//!
//! Every at-rest ciphertext in the store is one blob:
//!
//! ```text
//! nonce(12) ‖ ciphertext ‖ tag(16)
//! ```
//!
//! The nonce is fresh per call, so the same plaintext sealed twice yields
//! different blobs.

use crate::chacha20::{self, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::{CryptoError, Result};

/// Smallest possible blob: nonce plus the tag of an empty plaintext.
pub const MIN_BLOB_LEN: usize = NONCE_SIZE + TAG_SIZE;

/// Seal plaintext under a key with associated data.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);

    let ct = chacha20::encrypt(key, &nonce, plaintext, aad)?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ct.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ct);
    Ok(blob)
}

/// Open a sealed blob.
///
/// Truncated blobs fail with [`CryptoError::InvalidLength`]; anything that
/// parses but does not authenticate fails with
/// [`CryptoError::Authentication`].
pub fn open(key: &[u8; KEY_SIZE], blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < MIN_BLOB_LEN {
        return Err(CryptoError::InvalidLength {
            expected: MIN_BLOB_LEN,
            actual: blob.len(),
        });
    }

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&blob[..NONCE_SIZE]);

    chacha20::decrypt(key, &nonce, &blob[NONCE_SIZE..], aad)
}

/// Seal a UTF-8 string.
pub fn seal_str(key: &[u8; KEY_SIZE], plaintext: &str, aad: &[u8]) -> Result<Vec<u8>> {
    seal(key, plaintext.as_bytes(), aad)
}

/// Open a blob into a UTF-8 string. Non-UTF-8 plaintext is treated as an
/// authentication failure: a correctly opened mail body is always text.
pub fn open_str(key: &[u8; KEY_SIZE], blob: &[u8], aad: &[u8]) -> Result<String> {
    let pt = open(key, blob, aad)?;
    String::from_utf8(pt).map_err(|_| CryptoError::Authentication)
}

/// Build the AAD bound into mail ciphertexts: the sender's username and the
/// compose-time clock in whole seconds.
pub fn mail_aad(sender_username: &str, epoch_secs: i64) -> Vec<u8> {
    format!("{sender_username}|{epoch_secs}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_SIZE] = [0x24u8; KEY_SIZE];

    #[test]
    fn test_seal_open_roundtrip() {
        let blob = seal(&KEY, b"73 de ADV", b"aad").expect("seal");
        let pt = open(&KEY, &blob, b"aad").expect("open");
        assert_eq!(pt, b"73 de ADV");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let a = seal(&KEY, b"same", b"").expect("seal");
        let b = seal(&KEY, b"same", b"").expect("seal");
        assert_ne!(a, b);
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let blob = seal(&KEY, b"body", b"alice|1702000000").expect("seal");
        assert!(matches!(
            open(&KEY, &blob, b"alice|1702000001"),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_truncated_blob() {
        let blob = seal(&KEY, b"body", b"").expect("seal");
        assert!(matches!(
            open(&KEY, &blob[..MIN_BLOB_LEN - 1], b""),
            Err(CryptoError::InvalidLength { .. })
        ));
        assert!(matches!(
            open(&KEY, &[], b""),
            Err(CryptoError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = seal(&KEY, b"body", b"").expect("seal");
        let other = [0x25u8; KEY_SIZE];
        assert!(open(&other, &blob, b"").is_err());
    }

    #[test]
    fn test_string_helpers() {
        let blob = seal_str(&KEY, "board post", b"").expect("seal");
        assert_eq!(open_str(&KEY, &blob, b"").expect("open"), "board post");
    }

    #[test]
    fn test_mail_aad_format() {
        assert_eq!(mail_aad("alice", 1702000000), b"alice|1702000000".to_vec());
    }
}
