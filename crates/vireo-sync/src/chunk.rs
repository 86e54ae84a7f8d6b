//! Payload chunking for the frame MTU.
//!
//! Remote mail chunks by character count (the body cap is specified in
//! characters); bulletin batches chunk by UTF-8 byte budget since their
//! payloads carry packed multi-record streams.

/// Chunk size for remote-mail bodies, in characters.
pub const MAIL_CHUNK_CHARS: usize = 150;

/// Maximum remote-mail body length, in characters (3 chunks).
pub const MAIL_MAX_CHARS: usize = 450;

/// Chunk size for bulletin batch payloads, in bytes.
pub const BOARD_CHUNK_BYTES: usize = 150;

/// Split a body into chunks of at most `size` characters.
pub fn chunk_chars(body: &str, size: usize) -> Vec<String> {
    if body.is_empty() {
        return vec![String::new()];
    }
    let chars: Vec<char> = body.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Split a payload into chunks of at most `size` bytes, never splitting a
/// UTF-8 sequence.
pub fn chunk_bytes(payload: &str, size: usize) -> Vec<String> {
    if payload.is_empty() {
        return vec![String::new()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for c in payload.chars() {
        if current.len() + c.len_utf8() > size && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Reassemble chunks received in any order. Returns `None` until every
/// sequence number `1..=total` is present.
pub fn reassemble(received: &std::collections::HashMap<u32, String>, total: u32) -> Option<String> {
    let mut body = String::new();
    for seq in 1..=total {
        body.push_str(received.get(&seq)?);
    }
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_chunk_chars_boundaries() {
        assert_eq!(chunk_chars("abc", 150), vec!["abc"]);
        assert_eq!(chunk_chars(&"x".repeat(150), 150).len(), 1);
        assert_eq!(chunk_chars(&"x".repeat(151), 150).len(), 2);
        assert_eq!(chunk_chars(&"x".repeat(450), 150).len(), 3);

        let chunks = chunk_chars(&"x".repeat(301), 150);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 1);
    }

    #[test]
    fn test_chunk_chars_counts_characters_not_bytes() {
        // Multibyte characters count once each.
        let body = "é".repeat(150);
        assert_eq!(chunk_chars(&body, 150).len(), 1);
    }

    #[test]
    fn test_chunk_bytes_respects_utf8() {
        let payload = format!("{}é", "x".repeat(149));
        let chunks = chunk_bytes(&payload, 150);
        // 'é' is 2 bytes and cannot share the first 150-byte chunk.
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 149);
        assert_eq!(chunks[1], "é");
        assert_eq!(chunks.concat(), payload);
    }

    #[test]
    fn test_chunk_bytes_budget() {
        let payload = "a".repeat(500);
        let chunks = chunk_bytes(&payload, 150);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() <= 150));
        assert_eq!(chunks.concat(), payload);
    }

    #[test]
    fn test_reassemble_any_order() {
        let body = "x".repeat(320);
        let chunks = chunk_chars(&body, 150);
        let mut received = HashMap::new();
        received.insert(3, chunks[2].clone());
        received.insert(1, chunks[0].clone());
        assert!(reassemble(&received, 3).is_none());
        received.insert(2, chunks[1].clone());
        assert_eq!(reassemble(&received, 3).expect("complete"), body);
    }

    #[test]
    fn test_empty_body() {
        assert_eq!(chunk_chars("", 150), vec![String::new()]);
        assert_eq!(chunk_bytes("", 150), vec![String::new()]);
    }
}
