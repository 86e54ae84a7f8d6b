//! Message kinds and shared delivery constants.

use serde::{Deserialize, Serialize};

use crate::{Result, TypeError};

/// Kind of a stored message.
///
/// Stored as a string column for forward compatibility; validated into this
/// enum on load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Mail,
    Bulletin,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Mail => "mail",
            MessageType::Bulletin => "bulletin",
            MessageType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "mail" => Ok(MessageType::Mail),
            "bulletin" => Ok(MessageType::Bulletin),
            "system" => Ok(MessageType::System),
            other => Err(TypeError::InvalidEnumValue {
                field: "msg_type",
                value: other.to_string(),
            }),
        }
    }
}

/// Local delivery retry budget.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Base ACK window for the local delivery backoff ladder.
pub const ACK_TIMEOUT_SECS: i64 = 30;

/// Backoff multipliers per delivery attempt: 30s, 60s, 120s.
pub const BACKOFF_MULTIPLIERS: [i64; 3] = [1, 2, 4];

/// A mail row is failed rather than forwarded once it reaches this hop count.
pub const MAX_HOP_COUNT: u32 = 3;

/// Default mail retention.
pub const MAIL_EXPIRY_DAYS: i64 = 30;

/// Default bulletin retention.
pub const BULLETIN_EXPIRY_DAYS: i64 = 90;
