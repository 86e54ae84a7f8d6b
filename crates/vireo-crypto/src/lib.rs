//! # vireo-crypto
//!
//! Cryptographic primitives for the Vireo BBS core.
//!
//! One AEAD construction (ChaCha20-Poly1305) is used for every at-rest
//! ciphertext; one memory-hard KDF (Argon2id, tuned for small single-board
//! computers) turns passwords into keys. Per-user data keys are additionally
//! sealed under the operator master key so the operator can recover a
//! mailbox without the user's password.
//!
//! ## Modules
//!
//! - [`argon2id`] — password → key derivation and verifier hashing
//! - [`chacha20`] — raw ChaCha20-Poly1305 AEAD (explicit nonce)
//! - [`envelope`] — self-contained ciphertext blobs (`nonce ‖ ct ‖ tag`)
//! - [`master`] — operator master key and per-user key escrow

pub mod argon2id;
pub mod chacha20;
pub mod envelope;
pub mod master;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD open failed: tampering, truncation past the header, or a wrong
    /// key/AAD. Deliberately carries no detail.
    #[error("authentication failed")]
    Authentication,

    /// Ciphertext blob shorter than the nonce + tag framing.
    #[error("ciphertext too short: {actual} bytes, need at least {expected}")]
    InvalidLength { expected: usize, actual: usize },

    /// KDF parameters outside the configured budget.
    #[error("KDF budget exceeded: {0}")]
    KdfBudgetExceeded(String),

    /// Argon2 internals rejected the inputs.
    #[error("argon2id error: {0}")]
    Argon2(String),

    /// Invalid key material length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, CryptoError>;
