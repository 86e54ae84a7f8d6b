//! Wire grammar for the protocol frames.
//!
//! All frames are UTF-8 text, pipe-delimited, no quoting, no trailing
//! newline. The accepted identifier alphabets guarantee `|` cannot occur in
//! any field except chunk bodies, which are always the final field and
//! parsed with a bounded split so embedded pipes survive.

use std::fmt;

use crate::{Result, SyncError};

/// Prefix of native-envelope frames.
pub const NATIVE_TAG: &str = "advBBS";

/// Native envelope protocol version.
pub const NATIVE_VERSION: &str = "1";

/// Rejection reasons carried by `MAILNAK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NakReason {
    /// The relaying BBS found itself in the route list.
    Loop,
    /// Hop count beyond the relay cap.
    MaxHops,
    /// Recipient unknown at the destination BBS.
    NoUser,
    /// No usable route toward the destination.
    NoRoute,
}

impl NakReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NakReason::Loop => "LOOP",
            NakReason::MaxHops => "MAXHOPS",
            NakReason::NoUser => "NOUSER",
            NakReason::NoRoute => "NOROUTE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOOP" => Some(NakReason::Loop),
            "MAXHOPS" => Some(NakReason::MaxHops),
            "NOUSER" => Some(NakReason::NoUser),
            "NOROUTE" => Some(NakReason::NoRoute),
            _ => None,
        }
    }
}

impl fmt::Display for NakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `MAILREQ`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailReq {
    pub uuid: String,
    pub from_user: String,
    pub from_bbs: String,
    pub to_user: String,
    pub to_bbs: String,
    pub hop: u32,
    pub parts: u32,
    /// Callsigns of every BBS the request has passed through, in order.
    pub route: Vec<String>,
}

impl MailReq {
    pub fn encode(&self) -> String {
        format!(
            "MAILREQ|{}|{}|{}|{}|{}|{}|{}|{}",
            self.uuid,
            self.from_user,
            self.from_bbs,
            self.to_user,
            self.to_bbs,
            self.hop,
            self.parts,
            self.route.join(",")
        )
    }

    /// Whether a callsign already appears in the route (loop detection).
    pub fn route_contains(&self, callsign: &str) -> bool {
        self.route.iter().any(|r| r.eq_ignore_ascii_case(callsign))
    }
}

/// A parsed remote-mail verb.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailVerb {
    Req(MailReq),
    Ack {
        uuid: String,
        status: String,
    },
    Nak {
        uuid: String,
        reason: NakReason,
    },
    Dat {
        uuid: String,
        seq: u32,
        total: u32,
        chunk: String,
    },
    Dlv {
        uuid: String,
        status: String,
        /// `final_recipient@dst_bbs`
        destination: String,
    },
}

impl MailVerb {
    /// Parse a `MAIL*` frame.
    pub fn parse(text: &str) -> Result<Self> {
        if let Some(rest) = text.strip_prefix("MAILREQ|") {
            let fields: Vec<&str> = rest.split('|').collect();
            if fields.len() < 8 {
                return Err(malformed("MAILREQ", text));
            }
            let hop = fields[5].parse().map_err(|_| malformed("MAILREQ", text))?;
            let parts = fields[6].parse().map_err(|_| malformed("MAILREQ", text))?;
            return Ok(MailVerb::Req(MailReq {
                uuid: fields[0].to_string(),
                from_user: fields[1].to_string(),
                from_bbs: fields[2].to_string(),
                to_user: fields[3].to_string(),
                to_bbs: fields[4].to_string(),
                hop,
                parts,
                route: fields[7].split(',').map(str::to_string).collect(),
            }));
        }

        if let Some(rest) = text.strip_prefix("MAILACK|") {
            let (uuid, status) = rest.split_once('|').ok_or_else(|| malformed("MAILACK", text))?;
            return Ok(MailVerb::Ack {
                uuid: uuid.to_string(),
                status: status.to_string(),
            });
        }

        if let Some(rest) = text.strip_prefix("MAILNAK|") {
            let (uuid, reason) = rest.split_once('|').ok_or_else(|| malformed("MAILNAK", text))?;
            let reason = NakReason::parse(reason).ok_or_else(|| malformed("MAILNAK", text))?;
            return Ok(MailVerb::Nak {
                uuid: uuid.to_string(),
                reason,
            });
        }

        if let Some(rest) = text.strip_prefix("MAILDAT|") {
            // Bounded split: the chunk is the last field and may contain '|'.
            let mut fields = rest.splitn(3, '|');
            let uuid = fields.next().ok_or_else(|| malformed("MAILDAT", text))?;
            let part = fields.next().ok_or_else(|| malformed("MAILDAT", text))?;
            let chunk = fields.next().ok_or_else(|| malformed("MAILDAT", text))?;
            let (seq, total) = parse_seq(part).ok_or_else(|| malformed("MAILDAT", text))?;
            return Ok(MailVerb::Dat {
                uuid: uuid.to_string(),
                seq,
                total,
                chunk: chunk.to_string(),
            });
        }

        if let Some(rest) = text.strip_prefix("MAILDLV|") {
            let fields: Vec<&str> = rest.splitn(3, '|').collect();
            if fields.len() < 3 {
                return Err(malformed("MAILDLV", text));
            }
            return Ok(MailVerb::Dlv {
                uuid: fields[0].to_string(),
                status: fields[1].to_string(),
                destination: fields[2].to_string(),
            });
        }

        Err(malformed("MAIL", text))
    }

    pub fn encode(&self) -> String {
        match self {
            MailVerb::Req(req) => req.encode(),
            MailVerb::Ack { uuid, status } => format!("MAILACK|{uuid}|{status}"),
            MailVerb::Nak { uuid, reason } => format!("MAILNAK|{uuid}|{reason}"),
            MailVerb::Dat {
                uuid,
                seq,
                total,
                chunk,
            } => format!("MAILDAT|{uuid}|{seq}/{total}|{chunk}"),
            MailVerb::Dlv {
                uuid,
                status,
                destination,
            } => format!("MAILDLV|{uuid}|{status}|{destination}"),
        }
    }
}

/// Rejection reasons carried by `BOARDNAK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoardNakReason {
    NoBoard,
    NoSync,
}

impl BoardNakReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardNakReason::NoBoard => "NOBOARD",
            BoardNakReason::NoSync => "NOSYNC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NOBOARD" => Some(BoardNakReason::NoBoard),
            "NOSYNC" => Some(BoardNakReason::NoSync),
            _ => None,
        }
    }
}

impl fmt::Display for BoardNakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed bulletin-sync verb.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BoardVerb {
    Req {
        board: String,
        count: u32,
        since_us: i64,
    },
    Ack {
        board: String,
        status: String,
    },
    Nak {
        board: String,
        reason: BoardNakReason,
    },
    Dat {
        board: String,
        seq: u32,
        total: u32,
        chunk: String,
    },
    Dlv {
        board: String,
        status: String,
    },
}

impl BoardVerb {
    /// Parse a `BOARD*` frame.
    pub fn parse(text: &str) -> Result<Self> {
        if let Some(rest) = text.strip_prefix("BOARDREQ|") {
            let fields: Vec<&str> = rest.split('|').collect();
            if fields.len() < 3 {
                return Err(malformed("BOARDREQ", text));
            }
            let count = fields[1].parse().map_err(|_| malformed("BOARDREQ", text))?;
            let since_us = fields[2].parse().map_err(|_| malformed("BOARDREQ", text))?;
            return Ok(BoardVerb::Req {
                board: fields[0].to_string(),
                count,
                since_us,
            });
        }

        if let Some(rest) = text.strip_prefix("BOARDACK|") {
            let (board, status) = rest.split_once('|').ok_or_else(|| malformed("BOARDACK", text))?;
            return Ok(BoardVerb::Ack {
                board: board.to_string(),
                status: status.to_string(),
            });
        }

        if let Some(rest) = text.strip_prefix("BOARDNAK|") {
            let (board, reason) = rest.split_once('|').ok_or_else(|| malformed("BOARDNAK", text))?;
            let reason =
                BoardNakReason::parse(reason).ok_or_else(|| malformed("BOARDNAK", text))?;
            return Ok(BoardVerb::Nak {
                board: board.to_string(),
                reason,
            });
        }

        if let Some(rest) = text.strip_prefix("BOARDDAT|") {
            let mut fields = rest.splitn(3, '|');
            let board = fields.next().ok_or_else(|| malformed("BOARDDAT", text))?;
            let part = fields.next().ok_or_else(|| malformed("BOARDDAT", text))?;
            let chunk = fields.next().ok_or_else(|| malformed("BOARDDAT", text))?;
            let (seq, total) = parse_seq(part).ok_or_else(|| malformed("BOARDDAT", text))?;
            return Ok(BoardVerb::Dat {
                board: board.to_string(),
                seq,
                total,
                chunk: chunk.to_string(),
            });
        }

        if let Some(rest) = text.strip_prefix("BOARDDLV|") {
            let (board, status) = rest.split_once('|').ok_or_else(|| malformed("BOARDDLV", text))?;
            return Ok(BoardVerb::Dlv {
                board: board.to_string(),
                status: status.to_string(),
            });
        }

        Err(malformed("BOARD", text))
    }

    pub fn encode(&self) -> String {
        match self {
            BoardVerb::Req {
                board,
                count,
                since_us,
            } => format!("BOARDREQ|{board}|{count}|{since_us}"),
            BoardVerb::Ack { board, status } => format!("BOARDACK|{board}|{status}"),
            BoardVerb::Nak { board, reason } => format!("BOARDNAK|{board}|{reason}"),
            BoardVerb::Dat {
                board,
                seq,
                total,
                chunk,
            } => format!("BOARDDAT|{board}|{seq}/{total}|{chunk}"),
            BoardVerb::Dlv { board, status } => format!("BOARDDLV|{board}|{status}"),
        }
    }
}

/// A parsed native-envelope frame: `advBBS|<version>|<verb>|<payload>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeFrame {
    pub version: String,
    pub verb: String,
    pub payload: String,
}

/// Verbs defined under the native envelope.
pub const NATIVE_VERBS: &[&str] = &[
    "HELLO",
    "SYNC_REQ",
    "SYNC_MSG",
    "SYNC_ACK",
    "SYNC_DONE",
    "DELETE",
    "RAP_PING",
    "RAP_PONG",
    "RAP_ROUTES",
];

impl NativeFrame {
    /// Quick check that a frame looks like a native-envelope message with a
    /// known verb.
    pub fn matches(text: &str) -> bool {
        let mut fields = text.splitn(4, '|');
        if fields.next() != Some(NATIVE_TAG) {
            return false;
        }
        let _version = match fields.next() {
            Some(v) => v,
            None => return false,
        };
        match fields.next() {
            Some(verb) => NATIVE_VERBS.contains(&verb),
            None => false,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut fields = text.splitn(4, '|');
        let tag = fields.next().unwrap_or_default();
        if tag != NATIVE_TAG {
            return Err(malformed(NATIVE_TAG, text));
        }
        let version = fields.next().ok_or_else(|| malformed(NATIVE_TAG, text))?;
        let verb = fields.next().ok_or_else(|| malformed(NATIVE_TAG, text))?;
        if !NATIVE_VERBS.contains(&verb) {
            return Err(malformed(NATIVE_TAG, text));
        }
        Ok(NativeFrame {
            version: version.to_string(),
            verb: verb.to_string(),
            payload: fields.next().unwrap_or_default().to_string(),
        })
    }

    pub fn encode(verb: &str, payload: &str) -> String {
        format!("{NATIVE_TAG}|{NATIVE_VERSION}|{verb}|{payload}")
    }
}

/// Which protocol a frame belongs to, by prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Mail,
    Board,
    Native,
    Other,
}

/// Classify an inbound frame.
pub fn classify(text: &str) -> FrameKind {
    if text.starts_with("MAILREQ|")
        || text.starts_with("MAILACK|")
        || text.starts_with("MAILNAK|")
        || text.starts_with("MAILDAT|")
        || text.starts_with("MAILDLV|")
    {
        FrameKind::Mail
    } else if text.starts_with("BOARDREQ|")
        || text.starts_with("BOARDACK|")
        || text.starts_with("BOARDNAK|")
        || text.starts_with("BOARDDAT|")
        || text.starts_with("BOARDDLV|")
    {
        FrameKind::Board
    } else if NativeFrame::matches(text) {
        FrameKind::Native
    } else {
        FrameKind::Other
    }
}

fn parse_seq(part: &str) -> Option<(u32, u32)> {
    let (seq, total) = part.split_once('/')?;
    Some((seq.parse().ok()?, total.parse().ok()?))
}

fn malformed(verb: &str, text: &str) -> SyncError {
    let preview: String = text.chars().take(60).collect();
    SyncError::MalformedFrame(format!("{verb}: {preview}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailreq_roundtrip() {
        let req = MailReq {
            uuid: "u-1".into(),
            from_user: "alice".into(),
            from_bbs: "ADV".into(),
            to_user: "carol".into(),
            to_bbs: "MV51".into(),
            hop: 1,
            parts: 1,
            route: vec!["ADV".into()],
        };
        let encoded = req.encode();
        assert_eq!(encoded, "MAILREQ|u-1|alice|ADV|carol|MV51|1|1|ADV");
        assert_eq!(MailVerb::parse(&encoded).expect("parse"), MailVerb::Req(req));
    }

    #[test]
    fn test_multi_hop_route_list() {
        let verb = MailVerb::parse("MAILREQ|u|x|X|y|Y|2|1|ADV,MV51").expect("parse");
        match verb {
            MailVerb::Req(req) => {
                assert_eq!(req.route, vec!["ADV".to_string(), "MV51".to_string()]);
                assert!(req.route_contains("adv"));
                assert!(req.route_contains("MV51"));
                assert!(!req.route_contains("GL42"));
            }
            other => panic!("expected Req, got {other:?}"),
        }
    }

    #[test]
    fn test_maildat_chunk_swallows_pipes() {
        let verb = MailVerb::parse("MAILDAT|u-1|2/3|left|middle|right").expect("parse");
        assert_eq!(
            verb,
            MailVerb::Dat {
                uuid: "u-1".into(),
                seq: 2,
                total: 3,
                chunk: "left|middle|right".into(),
            }
        );
    }

    #[test]
    fn test_mailnak_reasons() {
        for (text, reason) in [
            ("MAILNAK|u|LOOP", NakReason::Loop),
            ("MAILNAK|u|MAXHOPS", NakReason::MaxHops),
            ("MAILNAK|u|NOUSER", NakReason::NoUser),
            ("MAILNAK|u|NOROUTE", NakReason::NoRoute),
        ] {
            match MailVerb::parse(text).expect("parse") {
                MailVerb::Nak { reason: parsed, .. } => assert_eq!(parsed, reason),
                other => panic!("expected Nak, got {other:?}"),
            }
        }
        assert!(MailVerb::parse("MAILNAK|u|BOGUS").is_err());
    }

    #[test]
    fn test_maildlv_fields() {
        let verb = MailVerb::parse("MAILDLV|u-1|OK|carol@MV51").expect("parse");
        assert_eq!(
            verb,
            MailVerb::Dlv {
                uuid: "u-1".into(),
                status: "OK".into(),
                destination: "carol@MV51".into(),
            }
        );
    }

    #[test]
    fn test_truncated_frames_rejected() {
        assert!(MailVerb::parse("MAILREQ|u|alice|ADV").is_err());
        assert!(MailVerb::parse("MAILACK|u").is_err());
        assert!(MailVerb::parse("MAILDAT|u|notseq|data").is_err());
        assert!(BoardVerb::parse("BOARDREQ|general").is_err());
    }

    #[test]
    fn test_board_roundtrips() {
        let req = BoardVerb::Req {
            board: "general".into(),
            count: 10,
            since_us: 1_702_000_000_000_000,
        };
        let encoded = req.encode();
        assert_eq!(encoded, "BOARDREQ|general|10|1702000000000000");
        assert_eq!(BoardVerb::parse(&encoded).expect("parse"), req);

        let dat = BoardVerb::Dat {
            board: "general".into(),
            seq: 1,
            total: 4,
            chunk: "payload|with|pipes".into(),
        };
        assert_eq!(BoardVerb::parse(&dat.encode()).expect("parse"), dat);
    }

    #[test]
    fn test_board_nak_reasons() {
        match BoardVerb::parse("BOARDNAK|general|NOBOARD").expect("parse") {
            BoardVerb::Nak { reason, .. } => assert_eq!(reason, BoardNakReason::NoBoard),
            other => panic!("expected Nak, got {other:?}"),
        }
        assert!(BoardVerb::parse("BOARDNAK|general|WHATEVER").is_err());
    }

    #[test]
    fn test_native_envelope() {
        assert!(NativeFrame::matches("advBBS|1|HELLO|ADV:vireo|mail"));
        assert!(NativeFrame::matches("advBBS|1|RAP_PING|1702000000000000"));
        assert!(NativeFrame::matches("advBBS|1|SYNC_DONE|"));
        assert!(!NativeFrame::matches("advBBS|1|UNKNOWN|payload"));
        assert!(!NativeFrame::matches("advBBS|"));
        assert!(!NativeFrame::matches("Hello world"));

        let frame = NativeFrame::parse("advBBS|1|RAP_PONG|123|ADV:0:1.0;MV51:1:0.90")
            .expect("parse");
        assert_eq!(frame.verb, "RAP_PONG");
        assert_eq!(frame.payload, "123|ADV:0:1.0;MV51:1:0.90");

        assert_eq!(
            NativeFrame::encode("RAP_PING", "42"),
            "advBBS|1|RAP_PING|42"
        );
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("MAILREQ|u|a|A|b|B|1|1|A"), FrameKind::Mail);
        assert_eq!(classify("BOARDDLV|general|OK"), FrameKind::Board);
        assert_eq!(classify("advBBS|1|HELLO|x"), FrameKind::Native);
        assert_eq!(classify("!mail"), FrameKind::Other);
        assert_eq!(classify("MAILBOX is full"), FrameKind::Other);
    }
}
