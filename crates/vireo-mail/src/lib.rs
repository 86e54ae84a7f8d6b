//! # vireo-mail
//!
//! The per-user side of the Vireo core: accounts with end-to-end-encrypted
//! mailboxes, and the mail delivery engine.
//!
//! - [`accounts`] — registration, authentication (password + node
//!   association), bans, password rotation with key reseal
//! - [`service`] — compose/read/list/delete, local-vs-remote dispatch, the
//!   AAD discipline with its legacy fallback
//! - [`delivery`] — the background worker that pokes recipients and walks
//!   the retry ladder

pub mod accounts;
pub mod delivery;
pub mod service;

pub use accounts::AccountService;
pub use service::{MailConfig, MailService, MailSummary, MailView};

/// Error types surfaced to the session layer. Messages are short enough to
/// fit a single frame.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("User '{0}' not found")]
    RecipientNotFound(String),

    #[error("Cannot send mail to banned user")]
    RecipientBanned,

    #[error("Cannot send mail to yourself")]
    SelfAddressed,

    #[error("Message too long (max {max} chars)")]
    BodyTooLong { max: usize },

    #[error("Message too long for remote delivery (max {max} chars, yours: {len})")]
    RemoteBodyTooLong { max: usize, len: usize },

    #[error("Message not found")]
    MessageNotFound,

    #[error("This message is not addressed to you")]
    NotYours,

    #[error("Failed to read message")]
    DecryptionFailed,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Login not permitted from this node")]
    NodeNotAuthorized,

    #[error("Account is banned")]
    UserBanned,

    #[error("Username is taken")]
    UsernameTaken,

    #[error("{0}")]
    InvalidIdentifier(String),

    #[error(transparent)]
    Db(#[from] vireo_db::DbError),

    #[error(transparent)]
    Crypto(#[from] vireo_crypto::CryptoError),

    #[error(transparent)]
    Sync(#[from] vireo_sync::SyncError),
}

pub type Result<T> = std::result::Result<T, MailError>;
