//! Sync bookkeeping per (message, peer, direction).

use rusqlite::{Connection, OptionalExtension};

use vireo_types::health::SyncDirection;

use crate::{DbError, Result};

/// Record a sync event. Repeats for the same key bump the attempt counter.
pub fn record(
    conn: &Connection,
    message_uuid: &str,
    peer_id: i64,
    direction: SyncDirection,
    status: &str,
    now_us: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_log (message_uuid, peer_id, direction, status, attempts, last_attempt_us)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)
         ON CONFLICT(message_uuid, peer_id, direction) DO UPDATE SET
             status = excluded.status,
             attempts = sync_log.attempts + 1,
             last_attempt_us = excluded.last_attempt_us",
        rusqlite::params![message_uuid, peer_id, direction.as_str(), status, now_us],
    )?;
    Ok(())
}

/// Whether a message was already sent to and acknowledged by a peer.
pub fn is_acked(conn: &Connection, message_uuid: &str, peer_id: i64) -> Result<bool> {
    let row: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sync_log
             WHERE message_uuid = ?1 AND peer_id = ?2 AND direction = 'sent' AND status = 'acked'",
            rusqlite::params![message_uuid, peer_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(row.is_some())
}

/// Attempt count for a sync-log entry, if present.
pub fn attempts(
    conn: &Connection,
    message_uuid: &str,
    peer_id: i64,
    direction: SyncDirection,
) -> Result<Option<u32>> {
    conn.query_row(
        "SELECT attempts FROM sync_log
         WHERE message_uuid = ?1 AND peer_id = ?2 AND direction = ?3",
        rusqlite::params![message_uuid, peer_id, direction.as_str()],
        |row| row.get(0),
    )
    .optional()
    .map_err(DbError::Sqlite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::peers;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    #[test]
    fn test_record_and_ack() {
        let conn = test_db();
        let peer = peers::upsert_configured(&conn, "!p1", "MV51", "advbbs", true, 1000)
            .expect("peer");

        record(&conn, "m-1", peer.id, SyncDirection::Sent, "pending", 1000).expect("record");
        assert!(!is_acked(&conn, "m-1", peer.id).expect("check"));

        record(&conn, "m-1", peer.id, SyncDirection::Sent, "acked", 2000).expect("record");
        assert!(is_acked(&conn, "m-1", peer.id).expect("check"));
        assert_eq!(
            attempts(&conn, "m-1", peer.id, SyncDirection::Sent).expect("attempts"),
            Some(2)
        );
    }

    #[test]
    fn test_directions_are_independent() {
        let conn = test_db();
        let peer = peers::upsert_configured(&conn, "!p1", "MV51", "advbbs", true, 1000)
            .expect("peer");

        record(&conn, "m-1", peer.id, SyncDirection::Received, "acked", 1000).expect("record");
        assert!(!is_acked(&conn, "m-1", peer.id).expect("check"));
        assert_eq!(
            attempts(&conn, "m-1", peer.id, SyncDirection::Received).expect("attempts"),
            Some(1)
        );
        assert_eq!(
            attempts(&conn, "m-1", peer.id, SyncDirection::Sent).expect("attempts"),
            None
        );
    }
}
