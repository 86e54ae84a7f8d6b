//! Argon2id password hashing and key derivation.
//!
//! Used for:
//! - per-user data-key derivation from the login password
//! - password verifier storage (raw output, constant-time compare)
//!
//! The default profile targets small single-board computers: 32 MiB memory,
//! 3 passes, 1 lane.

use argon2::{Algorithm, Argon2, Params, Version};

use crate::{CryptoError, Result};

/// Derived key length in bytes.
pub const KEY_LEN: usize = 32;

/// Per-user salt length in bytes (128 bits).
pub const SALT_LEN: usize = 16;

/// Hard ceiling on memory cost; anything above this is a misconfiguration
/// on the hardware this runs on.
pub const MAX_M_COST_KIB: u32 = 65536;

/// Argon2id cost parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost_kib: u32,
    /// Number of passes.
    pub t_cost: u32,
    /// Parallelism lanes.
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // 32 MiB, 3 passes, 1 lane.
        Self {
            m_cost_kib: 32768,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    /// Reject parameter sets outside the supported budget before any
    /// hashing happens.
    pub fn validate(&self) -> Result<()> {
        if self.m_cost_kib == 0 || self.m_cost_kib > MAX_M_COST_KIB {
            return Err(CryptoError::KdfBudgetExceeded(format!(
                "memory cost {} KiB outside 1..={MAX_M_COST_KIB}",
                self.m_cost_kib
            )));
        }
        if self.t_cost == 0 {
            return Err(CryptoError::KdfBudgetExceeded("zero passes".into()));
        }
        if self.p_cost == 0 {
            return Err(CryptoError::KdfBudgetExceeded("zero lanes".into()));
        }
        Ok(())
    }
}

/// Derive a 32-byte key from a password and salt.
///
/// Deterministic and side-effect-free: the same (password, salt, params)
/// always yields the same key.
pub fn derive_key(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<[u8; KEY_LEN]> {
    params.validate()?;

    let argon_params = Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(KEY_LEN))
        .map_err(|e| CryptoError::Argon2(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::Argon2(e.to_string()))?;

    Ok(output)
}

/// Hash a password into a stored verifier.
///
/// The verifier is the raw Argon2id output under the user's salt; it is
/// never used as an encryption key.
pub fn hash_password(password: &str, salt: &[u8], params: &KdfParams) -> Result<Vec<u8>> {
    Ok(derive_key(password.as_bytes(), salt, params)?.to_vec())
}

/// Verify a password against a stored verifier in constant time.
pub fn verify_password(
    password: &str,
    salt: &[u8],
    verifier: &[u8],
    params: &KdfParams,
) -> Result<bool> {
    let candidate = derive_key(password.as_bytes(), salt, params)?;
    Ok(ct_eq(&candidate, verifier))
}

/// Constant-time byte comparison.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a fresh random salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small parameters so the suite stays fast.
    fn test_params() -> KdfParams {
        KdfParams {
            m_cost_kib: 1024,
            t_cost: 1,
            p_cost: 1,
        }
    }

    #[test]
    fn test_derive_deterministic() {
        let salt = b"1234567890123456";
        let k1 = derive_key(b"hunter2", salt, &test_params()).expect("derive");
        let k2 = derive_key(b"hunter2", salt, &test_params()).expect("derive");
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_different_passwords_differ() {
        let salt = b"1234567890123456";
        let k1 = derive_key(b"pass1", salt, &test_params()).expect("derive");
        let k2 = derive_key(b"pass2", salt, &test_params()).expect("derive");
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_different_salts_differ() {
        let k1 = derive_key(b"pass", b"salt111111111111", &test_params()).expect("derive");
        let k2 = derive_key(b"pass", b"salt222222222222", &test_params()).expect("derive");
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_budget_rejected() {
        let over = KdfParams {
            m_cost_kib: MAX_M_COST_KIB + 1,
            t_cost: 3,
            p_cost: 1,
        };
        assert!(matches!(
            derive_key(b"p", b"1234567890123456", &over),
            Err(CryptoError::KdfBudgetExceeded(_))
        ));

        let zero = KdfParams {
            m_cost_kib: 1024,
            t_cost: 0,
            p_cost: 1,
        };
        assert!(matches!(
            derive_key(b"p", b"1234567890123456", &zero),
            Err(CryptoError::KdfBudgetExceeded(_))
        ));
    }

    #[test]
    fn test_password_verify() {
        let salt = generate_salt();
        let verifier = hash_password("correct horse", &salt, &test_params()).expect("hash");
        assert!(verify_password("correct horse", &salt, &verifier, &test_params()).expect("verify"));
        assert!(!verify_password("battery staple", &salt, &verifier, &test_params()).expect("verify"));
    }

    #[test]
    fn test_generate_salt_unique() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
