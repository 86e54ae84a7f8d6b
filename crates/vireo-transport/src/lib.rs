//! # vireo-transport
//!
//! Packet transport facade for the Vireo BBS core.
//!
//! The radio itself is an external adapter behind the [`radio::Radio`]
//! trait: it can send a text datagram, and it reports inbound frames, per
//! -hop link ACKs, and connection events over a channel. This crate wraps
//! that contract with everything the protocols need:
//!
//! - a global send-pacing floor (the link layer rate-limits text frames and
//!   silently drops on excess)
//! - link-ACK correlation for `send_text_await_ack`
//! - a reply-context table so native "reply to this message" gestures can be
//!   disambiguated later
//! - a reconnect state machine with exponential backoff
//!
//! Inbound frames are handed to the owner of the frame receiver — protocol
//! handlers never run on the adapter's thread.

pub mod facade;
pub mod loopback;
pub mod mock;
pub mod radio;

pub use facade::{Transport, TransportConfig};
pub use radio::{Frame, Radio, RadioEvent};

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link is down (disconnected or mid-reconnect); sends fail fast.
    #[error("not connected")]
    NotConnected,

    /// No link ACK arrived within the caller's window.
    #[error("send timed out")]
    SendTimeout,

    /// The link layer reported a delivery failure.
    #[error("link NAK: {0}")]
    LinkNak(String),

    /// The radio adapter failed to accept the frame.
    #[error("radio error: {0}")]
    Radio(String),

    /// Reconnect attempts exhausted; the transport is stopped.
    #[error("transport failed permanently: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Connection state of the facade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}
