//! # vireo-types
//!
//! Shared domain types for the Vireo BBS core.
//!
//! Everything here is dependency-light on purpose: the store, the transport,
//! the mail engine, and the sync engine all speak these types at their seams.
//!
//! ## Modules
//!
//! - [`ident`] — identifier validation (usernames, board names, callsigns)
//! - [`addr`] — remote mail address forms (`user@BBS`, transit addressing)
//! - [`message`] — message kinds and shared delivery constants
//! - [`health`] — peer health states and sync directions
//! - [`clock`] — microsecond epoch timestamps
//! - [`metrics`] — injected metrics sink

pub mod addr;
pub mod clock;
pub mod health;
pub mod ident;
pub mod message;
pub mod metrics;

/// Error types for domain-level parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    /// An identifier failed its shape rules.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A remote address string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A stored enum column held a value outside its domain.
    #[error("invalid enum value '{value}' for {field}")]
    InvalidEnumValue { field: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, TypeError>;
