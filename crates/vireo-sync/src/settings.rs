//! Sync engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A configured federation peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerSetting {
    /// Radio node identity (e.g. `!a1b2c3d4`).
    pub node_id: String,
    /// Peer BBS name; doubles as its callsign until a handshake supplies one.
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Engine tuning. Defaults match the protocol's conservative airtime
/// profile; tests shrink them.
#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub enabled: bool,
    /// Our BBS callsign (uppercase, used in wire verbs).
    pub callsign: String,
    /// Our BBS display name (used in the handshake).
    pub bbs_name: String,
    pub peers: Vec<PeerSetting>,

    // Remote mail
    /// Seconds between MAILREQ retries while awaiting MAILACK.
    pub mailreq_retry_secs: [i64; 3],
    pub mailreq_max_attempts: u32,
    /// Seconds between chunk-set retries while awaiting MAILDLV.
    pub maildlv_retry_secs: [i64; 3],
    pub maildlv_max_attempts: u32,
    /// Per-chunk link-ACK window.
    pub chunk_ack_timeout: Duration,
    /// Per-chunk link-ACK retries on first transmission.
    pub chunk_retries: u32,
    /// Per-chunk link-ACK retries on a resend pass.
    pub chunk_resend_retries: u32,
    /// Relay hop cap for MAILREQ.
    pub max_hops: u32,
    /// Seconds before an incomplete inbound chunk set is dropped.
    pub incoming_timeout_secs: i64,
    /// Seconds before relay state is dropped.
    pub relay_timeout_secs: i64,

    // Route announcement
    pub rap_enabled: bool,
    pub heartbeat_interval_secs: i64,
    pub heartbeat_timeout_secs: i64,
    pub route_share_interval_secs: i64,
    pub route_expiry_secs: i64,
    pub pending_mail_expiry_secs: i64,

    // Bulletin sync
    /// Post count that forces a flush.
    pub board_flush_threshold: u32,
    /// Elapsed seconds after which a single post is enough to flush.
    pub board_flush_interval_secs: i64,

    /// Seconds between expired-message sweeps.
    pub message_sweep_interval_secs: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            callsign: "ADV".to_string(),
            bbs_name: "vireo".to_string(),
            peers: Vec::new(),

            mailreq_retry_secs: [30, 60, 90],
            mailreq_max_attempts: 3,
            maildlv_retry_secs: [60, 120, 180],
            maildlv_max_attempts: 3,
            chunk_ack_timeout: Duration::from_secs(30),
            chunk_retries: 3,
            chunk_resend_retries: 2,
            max_hops: 5,
            incoming_timeout_secs: 300,
            relay_timeout_secs: 600,

            rap_enabled: true,
            heartbeat_interval_secs: 43_200,
            heartbeat_timeout_secs: 60,
            route_share_interval_secs: 86_400,
            route_expiry_secs: 129_600,
            pending_mail_expiry_secs: 86_400,

            board_flush_threshold: 10,
            board_flush_interval_secs: 3600,

            message_sweep_interval_secs: 600,
        }
    }
}

impl SyncSettings {
    /// Look up a configured peer by node identity.
    pub fn peer(&self, node_id: &str) -> Option<&PeerSetting> {
        self.peers.iter().find(|p| p.node_id == node_id)
    }

    /// Whether a node is a configured and enabled peer. Frames from anyone
    /// else never reach the mail or board protocols.
    pub fn is_peer(&self, node_id: &str) -> bool {
        self.peer(node_id).is_some_and(|p| p.enabled)
    }

    /// Find a configured peer by BBS name, case-insensitive.
    pub fn peer_by_name(&self, name: &str) -> Option<&PeerSetting> {
        self.peers
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}
