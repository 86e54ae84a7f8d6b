//! Identifier shape rules.
//!
//! These are enforced at the schema boundary so wire frames stay parseable:
//! none of the accepted alphabets can contain the `|` field separator.

use crate::{Result, TypeError};

/// Minimum and maximum username length.
pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 16;

/// Minimum and maximum board name length.
pub const BOARD_NAME_MIN: usize = 2;
pub const BOARD_NAME_MAX: usize = 16;

/// Validate a username: 3-16 chars of `[a-zA-Z0-9_]`.
pub fn validate_username(name: &str) -> Result<()> {
    if name.len() < USERNAME_MIN || name.len() > USERNAME_MAX {
        return Err(TypeError::InvalidIdentifier(format!(
            "username must be {USERNAME_MIN}-{USERNAME_MAX} characters"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(TypeError::InvalidIdentifier(
            "username may only contain letters, digits, and underscore".into(),
        ));
    }
    Ok(())
}

/// Validate a board name: 2-16 chars of `[a-z0-9_]`.
pub fn validate_board_name(name: &str) -> Result<()> {
    if name.len() < BOARD_NAME_MIN || name.len() > BOARD_NAME_MAX {
        return Err(TypeError::InvalidIdentifier(format!(
            "board name must be {BOARD_NAME_MIN}-{BOARD_NAME_MAX} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(TypeError::InvalidIdentifier(
            "board name may only contain lowercase letters, digits, and underscore".into(),
        ));
    }
    Ok(())
}

/// Validate a BBS callsign: non-empty `[A-Z0-9]+`.
pub fn validate_callsign(callsign: &str) -> Result<()> {
    if callsign.is_empty() {
        return Err(TypeError::InvalidIdentifier("callsign cannot be empty".into()));
    }
    if !callsign
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return Err(TypeError::InvalidIdentifier(
            "callsign may only contain uppercase letters and digits".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_usernames() {
        assert!(validate_username("bob").is_ok());
        assert!(validate_username("alice_99").is_ok());
        assert!(validate_username("ABCDEFGHIJKLMNOP").is_ok());
    }

    #[test]
    fn test_invalid_usernames() {
        assert!(validate_username("ab").is_err());
        assert!(validate_username("this_name_is_way_too_long").is_err());
        assert!(validate_username("bad name").is_err());
        assert!(validate_username("pipe|char").is_err());
        assert!(validate_username("dash-ed").is_err());
    }

    #[test]
    fn test_valid_board_names() {
        assert!(validate_board_name("general").is_ok());
        assert!(validate_board_name("hf").is_ok());
        assert!(validate_board_name("net_ops_2").is_ok());
    }

    #[test]
    fn test_invalid_board_names() {
        assert!(validate_board_name("x").is_err());
        assert!(validate_board_name("General").is_err());
        assert!(validate_board_name("board-name").is_err());
        assert!(validate_board_name("averyverylongboardname").is_err());
    }

    #[test]
    fn test_callsigns() {
        assert!(validate_callsign("ADV").is_ok());
        assert!(validate_callsign("MV51").is_ok());
        assert!(validate_callsign("").is_err());
        assert!(validate_callsign("mv51").is_err());
        assert!(validate_callsign("MV 51").is_err());
    }
}
