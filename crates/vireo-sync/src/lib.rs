//! # vireo-sync
//!
//! Inter-BBS synchronization for the Vireo core: the engine that moves mail
//! and bulletins between BBS instances over chunked text datagrams, and
//! discovers multi-hop paths to non-adjacent peers.
//!
//! Three wire protocols share the engine:
//!
//! - **Remote mail** — `MAILREQ`/`MAILACK`/`MAILNAK`/`MAILDAT`/`MAILDLV`,
//!   a five-verb handshake with chunking, relay, and loop/hop guards
//! - **Bulletin sync** — `BOARDREQ`… over the same five-verb shape, moving
//!   batched record streams with per-peer watermarks
//! - **Route announcement** — `RAP_PING`/`RAP_PONG`/`RAP_ROUTES` under the
//!   native envelope, driving peer health and the learned route table
//!
//! One engine task owns every piece of in-flight protocol state; see
//! [`engine`].

pub mod bsp;
pub mod chunk;
pub mod engine;
pub mod mrp;
pub mod native;
pub mod rap;
pub mod routes;
pub mod settings;
pub mod wire;

pub use engine::{EngineContext, SendOutcome, SyncEngine, SyncHandle};
pub use settings::{PeerSetting, SyncSettings};

use vireo_types::addr::RemoteAddr;

/// Error types for sync operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// No usable path to the destination BBS.
    #[error("No route to {0}")]
    RouteUnavailable(String),

    /// Body exceeds the remote-mail envelope.
    #[error("Message too long for remote delivery (max {max} chars, yours: {len})")]
    PayloadTooLong { max: usize, len: usize },

    /// The far side rejected the handshake.
    #[error("peer rejected: {0}")]
    PeerRejected(wire::NakReason),

    /// Chunks went out but no delivery confirmation ever arrived.
    #[error("no delivery confirmation")]
    NoDeliveryConfirmation,

    /// A frame failed to parse. Dropped, never answered.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A protocol frame arrived from a node that is not a configured peer.
    #[error("peer not authorized")]
    PeerNotAuthorized,

    /// Recipient unknown at the destination.
    #[error("user '{0}' not found")]
    UnknownRecipient(String),

    #[error(transparent)]
    Transport(#[from] vireo_transport::TransportError),

    #[error(transparent)]
    Db(#[from] vireo_db::DbError),

    #[error(transparent)]
    Crypto(#[from] vireo_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// A remote-mail send request handed to the engine.
#[derive(Clone, Debug)]
pub struct RemoteMailRequest {
    pub mail_uuid: String,
    pub sender_user_id: Option<i64>,
    pub sender: RemoteAddr,
    pub recipient: RemoteAddr,
    pub body: String,
}
