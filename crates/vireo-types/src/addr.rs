//! Remote mail addressing.
//!
//! Two string forms appear in the `forwarded_to` column and on the wire:
//!
//! - `user@BBS` — a delivered remote mail's original sender, or a compose
//!   target on another BBS.
//! - `sender@SRC>recipient@DST` — an outbound remote mail still in transit
//!   from this BBS.

use std::fmt;

use crate::{Result, TypeError};

/// A `user@BBS` address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteAddr {
    pub user: String,
    pub bbs: String,
}

impl RemoteAddr {
    pub fn parse(s: &str) -> Result<Self> {
        let (user, bbs) = s
            .split_once('@')
            .ok_or_else(|| TypeError::InvalidAddress(format!("missing '@' in '{s}'")))?;
        if user.is_empty() || bbs.is_empty() {
            return Err(TypeError::InvalidAddress(format!("empty component in '{s}'")));
        }
        Ok(Self {
            user: user.to_string(),
            bbs: bbs.to_string(),
        })
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.bbs)
    }
}

/// Transit addressing for an outbound remote mail:
/// `sender@SRC>recipient@DST`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitAddr {
    pub sender: RemoteAddr,
    pub recipient: RemoteAddr,
}

impl TransitAddr {
    pub fn parse(s: &str) -> Result<Self> {
        let (from, to) = s
            .split_once('>')
            .ok_or_else(|| TypeError::InvalidAddress(format!("missing '>' in '{s}'")))?;
        Ok(Self {
            sender: RemoteAddr::parse(from)?,
            recipient: RemoteAddr::parse(to)?,
        })
    }
}

impl fmt::Display for TransitAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{}", self.sender, self.recipient)
    }
}

/// Classify a `forwarded_to` value.
///
/// In-transit rows contain a `>`; delivered remote rows are a bare
/// `user@BBS`; anything else (delivery markers, peer node ids) is neither.
pub fn is_transit_addr(forwarded_to: &str) -> bool {
    forwarded_to.contains('>')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_addr_roundtrip() {
        let addr = RemoteAddr::parse("carol@MV51").expect("parse");
        assert_eq!(addr.user, "carol");
        assert_eq!(addr.bbs, "MV51");
        assert_eq!(addr.to_string(), "carol@MV51");
    }

    #[test]
    fn test_remote_addr_rejects_malformed() {
        assert!(RemoteAddr::parse("carol").is_err());
        assert!(RemoteAddr::parse("@MV51").is_err());
        assert!(RemoteAddr::parse("carol@").is_err());
    }

    #[test]
    fn test_transit_addr_roundtrip() {
        let addr = TransitAddr::parse("alice@ADV>carol@MV51").expect("parse");
        assert_eq!(addr.sender.user, "alice");
        assert_eq!(addr.sender.bbs, "ADV");
        assert_eq!(addr.recipient.user, "carol");
        assert_eq!(addr.recipient.bbs, "MV51");
        assert_eq!(addr.to_string(), "alice@ADV>carol@MV51");
    }

    #[test]
    fn test_transit_classification() {
        assert!(is_transit_addr("alice@ADV>carol@MV51"));
        assert!(!is_transit_addr("carol@MV51"));
        assert!(!is_transit_addr("DELIVERED:carol@MV51"));
    }
}
