//! Federation peer queries.
//!
//! A peer is a node configured (or discovered via handshake) as a
//! federation partner. Health status lives here as a string column for
//! forward compatibility and is validated into [`PeerHealth`] on load.

use rusqlite::{Connection, OptionalExtension};

use vireo_types::health::PeerHealth;

use crate::{not_found, DbError, Result};

/// A peer row.
#[derive(Debug, Clone)]
pub struct PeerRow {
    pub id: i64,
    pub node_id: String,
    pub callsign: Option<String>,
    pub name: Option<String>,
    pub protocol: String,
    pub sync_enabled: bool,
    pub capabilities: Option<String>,
    pub last_sync_us: i64,
    pub last_board_sync_us: i64,
    pub health: PeerHealth,
    pub failed_heartbeats: u32,
    pub last_pong_us: Option<i64>,
    pub quality_score: f64,
    pub first_seen_us: i64,
    pub last_seen_us: Option<i64>,
}

impl PeerRow {
    /// Best display identity for wire route entries: callsign, else name.
    pub fn wire_callsign(&self) -> Option<&str> {
        self.callsign.as_deref().or(self.name.as_deref())
    }
}

const COLUMNS: &str = "id, node_id, callsign, name, protocol, sync_enabled, capabilities, \
                       last_sync_us, last_board_sync_us, health_status, failed_heartbeats, \
                       last_pong_us, quality_score, first_seen_us, last_seen_us";

fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerRow> {
    let health_str: String = row.get(9)?;
    let health = PeerHealth::parse(&health_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        )
    })?;
    Ok(PeerRow {
        id: row.get(0)?,
        node_id: row.get(1)?,
        callsign: row.get(2)?,
        name: row.get(3)?,
        protocol: row.get(4)?,
        sync_enabled: row.get(5)?,
        capabilities: row.get(6)?,
        last_sync_us: row.get(7)?,
        last_board_sync_us: row.get(8)?,
        health,
        failed_heartbeats: row.get(10)?,
        last_pong_us: row.get(11)?,
        quality_score: row.get(12)?,
        first_seen_us: row.get(13)?,
        last_seen_us: row.get(14)?,
    })
}

/// Mirror a configured peer into the database, creating or updating.
pub fn upsert_configured(
    conn: &Connection,
    node_id: &str,
    name: &str,
    protocol: &str,
    sync_enabled: bool,
    now_us: i64,
) -> Result<PeerRow> {
    conn.execute(
        "INSERT INTO bbs_peers (node_id, name, callsign, protocol, sync_enabled, first_seen_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(node_id) DO UPDATE SET
             name = excluded.name,
             callsign = COALESCE(bbs_peers.callsign, excluded.callsign),
             protocol = excluded.protocol,
             sync_enabled = excluded.sync_enabled",
        rusqlite::params![node_id, name, name.to_uppercase(), protocol, sync_enabled, now_us],
    )?;
    get_by_node_id(conn, node_id)?.ok_or_else(|| DbError::NotFound("peer".into()))
}

/// Register or refresh a peer announced over the native handshake.
pub fn register_announced(
    conn: &Connection,
    node_id: &str,
    callsign: &str,
    name: &str,
    capabilities: &str,
    now_us: i64,
) -> Result<PeerRow> {
    conn.execute(
        "INSERT INTO bbs_peers (node_id, callsign, name, protocol, capabilities, first_seen_us, last_seen_us)
         VALUES (?1, ?2, ?3, 'advbbs', ?4, ?5, ?5)
         ON CONFLICT(node_id) DO UPDATE SET
             callsign = excluded.callsign,
             name = excluded.name,
             capabilities = excluded.capabilities,
             last_seen_us = excluded.last_seen_us",
        rusqlite::params![node_id, callsign, name, capabilities, now_us],
    )?;
    get_by_node_id(conn, node_id)?.ok_or_else(|| DbError::NotFound("peer".into()))
}

/// Ensure a bare peer row exists for a node that spoke to us.
pub fn ensure_exists(conn: &Connection, node_id: &str, now_us: i64) -> Result<PeerRow> {
    conn.execute(
        "INSERT INTO bbs_peers (node_id, protocol, first_seen_us, last_seen_us)
         VALUES (?1, 'advbbs', ?2, ?2)
         ON CONFLICT(node_id) DO UPDATE SET last_seen_us = excluded.last_seen_us",
        rusqlite::params![node_id, now_us],
    )?;
    get_by_node_id(conn, node_id)?.ok_or_else(|| DbError::NotFound("peer".into()))
}

/// Get a peer by its node identity.
pub fn get_by_node_id(conn: &Connection, node_id: &str) -> Result<Option<PeerRow>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM bbs_peers WHERE node_id = ?1"),
        [node_id],
        row_to_peer,
    )
    .optional()
    .map_err(DbError::Sqlite)
}

/// Get a peer by database id.
pub fn get_by_id(conn: &Connection, id: i64) -> Result<PeerRow> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM bbs_peers WHERE id = ?1"),
        [id],
        row_to_peer,
    )
    .map_err(not_found("peer"))
}

/// Get a peer by callsign or name, case-insensitive.
pub fn get_by_callsign(conn: &Connection, callsign: &str) -> Result<Option<PeerRow>> {
    conn.query_row(
        &format!(
            "SELECT {COLUMNS} FROM bbs_peers
             WHERE UPPER(COALESCE(callsign, name, '')) = UPPER(?1)"
        ),
        [callsign],
        row_to_peer,
    )
    .optional()
    .map_err(DbError::Sqlite)
}

/// All peers.
pub fn list(conn: &Connection) -> Result<Vec<PeerRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM bbs_peers ORDER BY id"))?;
    let rows = stmt
        .query_map([], row_to_peer)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Peers eligible for the hop-1 section of route advertisements:
/// sync-enabled, routable health, with a displayable callsign.
pub fn advertisable(conn: &Connection) -> Result<Vec<PeerRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM bbs_peers
         WHERE (callsign IS NOT NULL OR name IS NOT NULL)
           AND health_status IN ('unknown', 'alive')
           AND sync_enabled = 1
         ORDER BY id"
    ))?;
    let rows = stmt
        .query_map([], row_to_peer)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Record a peer as alive: health reset, failure counter cleared.
pub fn mark_alive(conn: &Connection, id: i64, now_us: i64, pong: bool) -> Result<()> {
    if pong {
        conn.execute(
            "UPDATE bbs_peers
             SET health_status = 'alive', failed_heartbeats = 0,
                 last_seen_us = ?1, last_pong_us = ?1
             WHERE id = ?2",
            rusqlite::params![now_us, id],
        )?;
    } else {
        conn.execute(
            "UPDATE bbs_peers
             SET health_status = 'alive', failed_heartbeats = 0, last_seen_us = ?1
             WHERE id = ?2",
            rusqlite::params![now_us, id],
        )?;
    }
    Ok(())
}

/// Record a missed heartbeat and the resulting health state.
pub fn record_heartbeat_failure(
    conn: &Connection,
    id: i64,
    failed: u32,
    health: PeerHealth,
) -> Result<()> {
    conn.execute(
        "UPDATE bbs_peers SET failed_heartbeats = ?1, health_status = ?2 WHERE id = ?3",
        rusqlite::params![failed, health.as_str(), id],
    )?;
    Ok(())
}

/// Advance a peer's mail-sync watermark.
pub fn set_last_sync(conn: &Connection, node_id: &str, sync_us: i64) -> Result<()> {
    conn.execute(
        "UPDATE bbs_peers SET last_sync_us = ?1 WHERE node_id = ?2",
        rusqlite::params![sync_us, node_id],
    )?;
    Ok(())
}

/// Advance a peer's board-sync watermark.
pub fn set_last_board_sync(conn: &Connection, node_id: &str, sync_us: i64) -> Result<()> {
    conn.execute(
        "UPDATE bbs_peers SET last_board_sync_us = ?1 WHERE node_id = ?2",
        rusqlite::params![sync_us, node_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    #[test]
    fn test_upsert_configured() {
        let conn = test_db();
        let peer = upsert_configured(&conn, "!peer0001", "mv51", "advbbs", true, 1000)
            .expect("upsert");
        assert_eq!(peer.callsign.as_deref(), Some("MV51"));
        assert_eq!(peer.health, PeerHealth::Unknown);
        assert!(peer.sync_enabled);

        // Re-upserting keeps the existing callsign but refreshes the rest.
        let again = upsert_configured(&conn, "!peer0001", "mv51-renamed", "advbbs", false, 2000)
            .expect("upsert");
        assert_eq!(again.id, peer.id);
        assert_eq!(again.callsign.as_deref(), Some("MV51"));
        assert_eq!(again.name.as_deref(), Some("mv51-renamed"));
        assert!(!again.sync_enabled);
    }

    #[test]
    fn test_callsign_lookup_case_insensitive() {
        let conn = test_db();
        upsert_configured(&conn, "!peer0001", "MV51", "advbbs", true, 1000).expect("upsert");
        assert!(get_by_callsign(&conn, "mv51").expect("get").is_some());
        assert!(get_by_callsign(&conn, "MV51").expect("get").is_some());
        assert!(get_by_callsign(&conn, "GL42").expect("get").is_none());
    }

    #[test]
    fn test_health_transitions_persist() {
        let conn = test_db();
        let peer = upsert_configured(&conn, "!peer0001", "MV51", "advbbs", true, 1000)
            .expect("upsert");

        record_heartbeat_failure(&conn, peer.id, 2, PeerHealth::Unreachable).expect("fail");
        let peer = get_by_id(&conn, peer.id).expect("get");
        assert_eq!(peer.health, PeerHealth::Unreachable);
        assert_eq!(peer.failed_heartbeats, 2);

        mark_alive(&conn, peer.id, 5000, true).expect("alive");
        let peer = get_by_id(&conn, peer.id).expect("get");
        assert_eq!(peer.health, PeerHealth::Alive);
        assert_eq!(peer.failed_heartbeats, 0);
        assert_eq!(peer.last_pong_us, Some(5000));
    }

    #[test]
    fn test_advertisable_filters() {
        let conn = test_db();
        let ok = upsert_configured(&conn, "!peer0001", "MV51", "advbbs", true, 1000)
            .expect("upsert");
        let dead = upsert_configured(&conn, "!peer0002", "GL42", "advbbs", true, 1000)
            .expect("upsert");
        upsert_configured(&conn, "!peer0003", "XX99", "advbbs", false, 1000).expect("upsert");
        record_heartbeat_failure(&conn, dead.id, 5, PeerHealth::Dead).expect("fail");

        let advertised = advertisable(&conn).expect("list");
        assert_eq!(advertised.len(), 1);
        assert_eq!(advertised[0].id, ok.id);
    }

    #[test]
    fn test_watermarks() {
        let conn = test_db();
        upsert_configured(&conn, "!peer0001", "MV51", "advbbs", true, 1000).expect("upsert");
        set_last_sync(&conn, "!peer0001", 7000).expect("sync");
        set_last_board_sync(&conn, "!peer0001", 8000).expect("board sync");

        let peer = get_by_node_id(&conn, "!peer0001").expect("get").expect("some");
        assert_eq!(peer.last_sync_us, 7000);
        assert_eq!(peer.last_board_sync_us, 8000);
    }
}
