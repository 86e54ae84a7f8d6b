//! Native sync envelope payloads.
//!
//! Structured payloads ride the `advBBS|1|<verb>|<payload>` envelope.
//! `SYNC_MSG` carries a message as compact JSON, base64-wrapped for
//! binary-safe transport. The field list is pinned here — explicit order,
//! `null` for absent optionals — so both ends agree byte-for-byte.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::{Result, SyncError};

/// The canonical `SYNC_MSG` payload.
///
/// Field order is the declaration order below; optional fields serialize as
/// `null`, never disappear.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub uuid: String,
    /// "mail" or "bulletin".
    pub msg_type: String,
    pub board: Option<String>,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub timestamp_us: i64,
    pub origin_bbs: Option<String>,
}

impl SyncMessage {
    /// Encode to the wire payload: compact JSON, then base64.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_string(self)
            .map_err(|e| SyncError::MalformedFrame(format!("SYNC_MSG encode: {e}")))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    /// Decode from the wire payload.
    pub fn decode(payload: &str) -> Result<Self> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| SyncError::MalformedFrame(format!("SYNC_MSG base64: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| SyncError::MalformedFrame(format!("SYNC_MSG json: {e}")))
    }
}

/// The `HELLO` payload: `callsign:name|capabilities`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub callsign: String,
    pub name: String,
    pub capabilities: Vec<String>,
}

impl Hello {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}|{}",
            self.callsign,
            self.name,
            self.capabilities.join(",")
        )
    }

    pub fn decode(payload: &str) -> Self {
        let (info, caps) = payload.split_once('|').unwrap_or((payload, ""));
        let (callsign, name) = info.split_once(':').unwrap_or((info, info));
        Hello {
            callsign: callsign.to_string(),
            name: name.to_string(),
            capabilities: caps
                .split(',')
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SyncMessage {
        SyncMessage {
            uuid: "test-uuid-123".into(),
            msg_type: "bulletin".into(),
            board: Some("general".into()),
            sender: Some("alice".into()),
            recipient: None,
            subject: Some("Test Subject".into()),
            body: Some("Test body content".into()),
            timestamp_us: 1_702_000_000_000_000,
            origin_bbs: Some("ADV".into()),
        }
    }

    #[test]
    fn test_sync_message_roundtrip() {
        let msg = sample();
        let encoded = msg.encode().expect("encode");
        let decoded = SyncMessage::decode(&encoded).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_absent_optionals_serialize_as_null() {
        let msg = sample();
        let json = serde_json::to_string(&msg).expect("json");
        assert!(json.contains("\"recipient\":null"));
        // Explicit field order: uuid leads, timestamp before origin.
        assert!(json.starts_with("{\"uuid\":"));
        let ts_pos = json.find("timestamp_us").expect("ts");
        let origin_pos = json.find("origin_bbs").expect("origin");
        assert!(ts_pos < origin_pos);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SyncMessage::decode("not base64 !!!").is_err());
        let bad_json = base64::engine::general_purpose::STANDARD.encode("{\"uuid\":");
        assert!(SyncMessage::decode(&bad_json).is_err());
    }

    #[test]
    fn test_unicode_content() {
        let msg = SyncMessage {
            sender: Some("用户".into()),
            subject: Some("主题".into()),
            body: Some("内容".into()),
            ..sample()
        };
        let decoded = SyncMessage::decode(&msg.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.sender.as_deref(), Some("用户"));
        assert_eq!(decoded.body.as_deref(), Some("内容"));
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = Hello {
            callsign: "ADV".into(),
            name: "vireo".into(),
            capabilities: vec!["mail".into()],
        };
        let encoded = hello.encode();
        assert_eq!(encoded, "ADV:vireo|mail");
        assert_eq!(Hello::decode(&encoded), hello);
    }

    #[test]
    fn test_hello_decode_degrades() {
        let hello = Hello::decode("PEER");
        assert_eq!(hello.callsign, "PEER");
        assert_eq!(hello.name, "PEER");
        assert!(hello.capabilities.is_empty());
    }
}
