//! Learned multi-hop route queries.
//!
//! A route maps a destination BBS callsign to the peer it was learned from,
//! with a hop count (>= 2 once the advertising peer's hop is added) and a
//! quality score used only as a tie-breaker. Routes expire on a fixed
//! horizon and evaporate when their via-peer dies.

use rusqlite::{Connection, OptionalExtension};

use crate::{DbError, Result};

/// A learned route row.
#[derive(Debug, Clone)]
pub struct RouteRow {
    pub id: i64,
    pub dest_bbs: String,
    pub via_peer_id: i64,
    pub hop_count: u32,
    pub quality_score: f64,
    pub last_updated_us: i64,
    pub expires_at_us: i64,
}

/// A chosen next hop for a destination.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteChoice {
    /// Node identity of the peer to hand the frame to.
    pub via_node_id: String,
    pub hop_count: u32,
    pub quality_score: f64,
}

fn row_to_route(row: &rusqlite::Row<'_>) -> rusqlite::Result<RouteRow> {
    Ok(RouteRow {
        id: row.get(0)?,
        dest_bbs: row.get(1)?,
        via_peer_id: row.get(2)?,
        hop_count: row.get(3)?,
        quality_score: row.get(4)?,
        last_updated_us: row.get(5)?,
        expires_at_us: row.get(6)?,
    })
}

const COLUMNS: &str =
    "id, dest_bbs, via_peer_id, hop_count, quality_score, last_updated_us, expires_at_us";

/// Insert or refresh a learned route.
///
/// On conflict the smaller hop count wins, but the quality and timestamps
/// always refresh — a live advertisement should never age out a route it
/// just confirmed.
pub fn upsert(
    conn: &Connection,
    dest_bbs: &str,
    via_peer_id: i64,
    hop_count: u32,
    quality_score: f64,
    now_us: i64,
    expires_at_us: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO rap_routes (dest_bbs, via_peer_id, hop_count, quality_score, last_updated_us, expires_at_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(dest_bbs, via_peer_id) DO UPDATE SET
             hop_count = MIN(excluded.hop_count, rap_routes.hop_count),
             quality_score = excluded.quality_score,
             last_updated_us = excluded.last_updated_us,
             expires_at_us = excluded.expires_at_us",
        rusqlite::params![dest_bbs, via_peer_id, hop_count, quality_score, now_us, expires_at_us],
    )?;
    Ok(())
}

/// Best learned route to a destination: smallest hop count, ties broken by
/// quality, restricted to unexpired routes whose via-peer health is
/// routable.
pub fn best(conn: &Connection, dest_bbs: &str, now_us: i64) -> Result<Option<RouteChoice>> {
    conn.query_row(
        "SELECT p.node_id, r.hop_count, r.quality_score
         FROM rap_routes r
         JOIN bbs_peers p ON r.via_peer_id = p.id
         WHERE UPPER(r.dest_bbs) = UPPER(?1)
           AND r.expires_at_us > ?2
           AND p.health_status IN ('unknown', 'alive')
         ORDER BY r.hop_count ASC, r.quality_score DESC
         LIMIT 1",
        rusqlite::params![dest_bbs, now_us],
        |row| {
            Ok(RouteChoice {
                via_node_id: row.get(0)?,
                hop_count: row.get(1)?,
                quality_score: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(DbError::Sqlite)
}

/// All unexpired routes, nearest first. Used to build advertisements.
pub fn list_active(conn: &Connection, now_us: i64) -> Result<Vec<RouteRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM rap_routes WHERE expires_at_us > ?1 ORDER BY hop_count ASC"
    ))?;
    let rows = stmt
        .query_map([now_us], row_to_route)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Destinations reachable via a given peer right now.
pub fn dests_via_peer(conn: &Connection, peer_id: i64, now_us: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT dest_bbs FROM rap_routes WHERE via_peer_id = ?1 AND expires_at_us > ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![peer_id, now_us], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(rows)
}

/// Sweep expired routes. Returns the count removed.
pub fn delete_expired(conn: &Connection, now_us: i64) -> Result<usize> {
    let n = conn.execute("DELETE FROM rap_routes WHERE expires_at_us < ?1", [now_us])?;
    Ok(n)
}

/// Drop every route learned via a peer (peer declared dead).
pub fn delete_via_peer(conn: &Connection, peer_id: i64) -> Result<usize> {
    let n = conn.execute("DELETE FROM rap_routes WHERE via_peer_id = ?1", [peer_id])?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::peers;
    use vireo_types::health::PeerHealth;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    fn make_peer(conn: &Connection, node_id: &str, callsign: &str) -> i64 {
        peers::upsert_configured(conn, node_id, callsign, "advbbs", true, 1000)
            .expect("peer")
            .id
    }

    #[test]
    fn test_upsert_keeps_smaller_hop() {
        let conn = test_db();
        let peer = make_peer(&conn, "!p1", "MV51");

        upsert(&conn, "GL42", peer, 2, 0.9, 1000, 10_000).expect("upsert");
        upsert(&conn, "GL42", peer, 4, 0.5, 2000, 20_000).expect("upsert");

        let routes = list_active(&conn, 1500).expect("list");
        assert_eq!(routes.len(), 1);
        // Hop stays at the smaller value; quality and expiry refresh.
        assert_eq!(routes[0].hop_count, 2);
        assert_eq!(routes[0].quality_score, 0.5);
        assert_eq!(routes[0].expires_at_us, 20_000);
    }

    #[test]
    fn test_best_prefers_fewer_hops_then_quality() {
        let conn = test_db();
        let near = make_peer(&conn, "!p1", "MV51");
        let far = make_peer(&conn, "!p2", "XR20");

        upsert(&conn, "GL42", near, 2, 0.5, 1000, 10_000).expect("upsert");
        upsert(&conn, "GL42", far, 3, 1.0, 1000, 10_000).expect("upsert");

        let choice = best(&conn, "gl42", 2000).expect("best").expect("some");
        assert_eq!(choice.via_node_id, "!p1");
        assert_eq!(choice.hop_count, 2);
    }

    #[test]
    fn test_quality_breaks_hop_ties() {
        let conn = test_db();
        let low = make_peer(&conn, "!p1", "MV51");
        let high = make_peer(&conn, "!p2", "XR20");

        upsert(&conn, "GL42", low, 2, 0.4, 1000, 10_000).expect("upsert");
        upsert(&conn, "GL42", high, 2, 0.9, 1000, 10_000).expect("upsert");

        let choice = best(&conn, "GL42", 2000).expect("best").expect("some");
        assert_eq!(choice.via_node_id, "!p2");
    }

    #[test]
    fn test_expired_route_never_selected() {
        let conn = test_db();
        let peer = make_peer(&conn, "!p1", "MV51");
        upsert(&conn, "GL42", peer, 2, 1.0, 1000, 5000).expect("upsert");

        assert!(best(&conn, "GL42", 4999).expect("best").is_some());
        assert!(best(&conn, "GL42", 5000).expect("best").is_none());
    }

    #[test]
    fn test_unroutable_peer_excluded() {
        let conn = test_db();
        let peer = make_peer(&conn, "!p1", "MV51");
        upsert(&conn, "GL42", peer, 2, 1.0, 1000, 10_000).expect("upsert");

        peers::record_heartbeat_failure(&conn, peer, 5, PeerHealth::Dead).expect("dead");
        assert!(best(&conn, "GL42", 2000).expect("best").is_none());
    }

    #[test]
    fn test_dead_peer_route_removal() {
        let conn = test_db();
        let p1 = make_peer(&conn, "!p1", "MV51");
        let p2 = make_peer(&conn, "!p2", "XR20");
        upsert(&conn, "GL42", p1, 2, 1.0, 1000, 10_000).expect("upsert");
        upsert(&conn, "ZZ90", p1, 3, 1.0, 1000, 10_000).expect("upsert");
        upsert(&conn, "GL42", p2, 3, 1.0, 1000, 10_000).expect("upsert");

        assert_eq!(delete_via_peer(&conn, p1).expect("delete"), 2);
        let remaining = list_active(&conn, 2000).expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].via_peer_id, p2);
    }

    #[test]
    fn test_expiry_sweep() {
        let conn = test_db();
        let peer = make_peer(&conn, "!p1", "MV51");
        upsert(&conn, "GL42", peer, 2, 1.0, 1000, 5000).expect("upsert");
        upsert(&conn, "ZZ90", peer, 2, 1.0, 1000, 50_000).expect("upsert");

        assert_eq!(delete_expired(&conn, 10_000).expect("sweep"), 1);
        assert_eq!(list_active(&conn, 10_000).expect("list").len(), 1);
    }

    #[test]
    fn test_dests_via_peer() {
        let conn = test_db();
        let peer = make_peer(&conn, "!p1", "MV51");
        upsert(&conn, "GL42", peer, 2, 1.0, 1000, 10_000).expect("upsert");
        upsert(&conn, "ZZ90", peer, 3, 1.0, 1000, 10_000).expect("upsert");

        let mut dests = dests_via_peer(&conn, peer, 2000).expect("dests");
        dests.sort();
        assert_eq!(dests, vec!["GL42".to_string(), "ZZ90".to_string()]);
    }
}
