//! Operator master key and per-user key escrow.
//!
//! Each user's 32-byte data key is stored twice: sealed to the key derived
//! from their password, and sealed under this master key. The second copy is
//! what lets the operator recover a mailbox after a password reset without
//! ever holding the user's password.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::chacha20::KEY_SIZE;
use crate::{envelope, CryptoError, Result};

/// The BBS operator's master key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_SIZE],
}

impl MasterKey {
    /// Wrap existing key material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Generate a fresh master key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut key);
        Self { key }
    }

    /// Raw key bytes, for persisting to the key file.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Seal a user's data key for escrow storage.
    pub fn seal_user_key(&self, user_key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
        envelope::seal(&self.key, user_key, &[])
    }

    /// Recover a user's data key from its escrow blob.
    pub fn open_user_key(&self, blob: &[u8]) -> Result<[u8; KEY_SIZE]> {
        let pt = envelope::open(&self.key, blob, &[])?;
        if pt.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: pt.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&pt);
        Ok(key)
    }

    /// Seal arbitrary plaintext directly under the master key.
    ///
    /// Bulletin bodies use this: boards have no per-user recipient, so their
    /// at-rest encryption is operator-scoped.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        envelope::seal(&self.key, plaintext, aad)
    }

    /// Open master-sealed plaintext.
    pub fn open(&self, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        envelope::open(&self.key, blob, aad)
    }
}

/// Generate a fresh per-user data key.
pub fn generate_user_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_key_escrow_roundtrip() {
        let master = MasterKey::generate();
        let user_key = generate_user_key();

        let blob = master.seal_user_key(&user_key).expect("seal");
        let recovered = master.open_user_key(&blob).expect("open");
        assert_eq!(recovered, user_key);
    }

    #[test]
    fn test_wrong_master_fails() {
        let master = MasterKey::generate();
        let other = MasterKey::generate();
        let blob = master.seal_user_key(&generate_user_key()).expect("seal");
        assert!(other.open_user_key(&blob).is_err());
    }

    #[test]
    fn test_from_bytes_length_check() {
        assert!(MasterKey::from_bytes(&[0u8; 31]).is_err());
        assert!(MasterKey::from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_direct_seal_open() {
        let master = MasterKey::generate();
        let blob = master.seal(b"bulletin body", b"").expect("seal");
        assert_eq!(master.open(&blob, b"").expect("open"), b"bulletin body");
    }
}
