//! The radio adapter contract.

use tokio::sync::mpsc;

use crate::Result;

/// Destination for channel-wide broadcasts.
pub const BROADCAST_ADDR: &str = "^all";

/// An inbound text frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Sender node identity.
    pub from: String,
    /// Destination node identity (ours, or the broadcast address).
    pub to: String,
    /// Frame text.
    pub text: String,
    /// Radio channel index.
    pub channel: u32,
    /// Native reply-to id, when the sender replied to one of our frames.
    pub reply_id: Option<u32>,
}

/// Events the adapter delivers to the facade.
#[derive(Clone, Debug)]
pub enum RadioEvent {
    /// A text frame arrived.
    Frame(Frame),
    /// Link-level delivery result for a send that requested an ACK.
    LinkAck {
        request_id: u32,
        delivered: bool,
        reason: String,
    },
    /// The underlying connection came up.
    Connected,
    /// The underlying connection dropped.
    Disconnected,
}

/// A radio adapter.
///
/// Implementations own their I/O thread; they must deliver events through
/// the sender handed to [`Radio::start`] and never invoke protocol code
/// directly.
pub trait Radio: Send + Sync + 'static {
    /// Connect and begin delivering events.
    fn start(&self, events: mpsc::Sender<RadioEvent>) -> Result<()>;

    /// Re-establish a dropped connection.
    fn reconnect(&self) -> Result<()>;

    /// Tear down the connection.
    fn shutdown(&self);

    /// Send a text datagram.
    ///
    /// Returns the adapter's request id when an ACK was requested and the
    /// adapter can correlate one, `None` otherwise.
    fn send_text(
        &self,
        text: &str,
        destination: &str,
        channel: u32,
        want_ack: bool,
    ) -> Result<Option<u32>>;

    /// Our own node identity, once known.
    fn node_id(&self) -> Option<String>;
}
