//! Peer health states and sync directions.

use serde::{Deserialize, Serialize};

use crate::{Result, TypeError};

/// Liveness state of a federation peer, driven by the heartbeat protocol.
///
/// ```text
/// UNKNOWN --any inbound--> ALIVE
/// ALIVE --2 missed pings--> UNREACHABLE
/// UNREACHABLE --5 total missed--> DEAD
/// UNREACHABLE | DEAD --any inbound--> ALIVE
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerHealth {
    Unknown,
    Alive,
    Unreachable,
    Dead,
}

impl PeerHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerHealth::Unknown => "unknown",
            PeerHealth::Alive => "alive",
            PeerHealth::Unreachable => "unreachable",
            PeerHealth::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "unknown" => Ok(PeerHealth::Unknown),
            "alive" => Ok(PeerHealth::Alive),
            "unreachable" => Ok(PeerHealth::Unreachable),
            "dead" => Ok(PeerHealth::Dead),
            other => Err(TypeError::InvalidEnumValue {
                field: "health_status",
                value: other.to_string(),
            }),
        }
    }

    /// Whether a route through this peer is usable for selection.
    pub fn routable(&self) -> bool {
        matches!(self, PeerHealth::Unknown | PeerHealth::Alive)
    }
}

/// Missed heartbeats before a peer is considered unreachable.
pub const UNREACHABLE_THRESHOLD: u32 = 2;

/// Total missed heartbeats before a peer is considered dead.
pub const DEAD_THRESHOLD: u32 = 5;

/// Direction of a sync-log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Sent,
    Received,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Sent => "sent",
            SyncDirection::Received => "received",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sent" => Ok(SyncDirection::Sent),
            "received" => Ok(SyncDirection::Received),
            other => Err(TypeError::InvalidEnumValue {
                field: "direction",
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_roundtrip() {
        for h in [
            PeerHealth::Unknown,
            PeerHealth::Alive,
            PeerHealth::Unreachable,
            PeerHealth::Dead,
        ] {
            assert_eq!(PeerHealth::parse(h.as_str()).expect("parse"), h);
        }
    }

    #[test]
    fn test_routable_states() {
        assert!(PeerHealth::Unknown.routable());
        assert!(PeerHealth::Alive.routable());
        assert!(!PeerHealth::Unreachable.routable());
        assert!(!PeerHealth::Dead.routable());
    }

    #[test]
    fn test_health_rejects_unknown_value() {
        assert!(PeerHealth::parse("online").is_err());
    }
}
