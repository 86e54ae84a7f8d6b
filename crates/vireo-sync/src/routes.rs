//! Route advertisements and selection.
//!
//! The wire form is `callsign:hop:quality;callsign:hop:quality;…`. The
//! sender always advertises itself at hop 0 and every routable direct peer
//! at hop 1; learned routes follow at hop >= 2, deduplicated by
//! destination.

use rusqlite::Connection;

use vireo_db::queries::{peers, routes};
use vireo_db::Result as DbResult;

/// One advertised route entry.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteAd {
    pub dest_bbs: String,
    pub hop: u32,
    pub quality: f64,
}

/// Parse a `routes_csv` payload. Unparseable entries are skipped — a
/// damaged advertisement should not poison the rest.
pub fn parse_routes_csv(csv: &str) -> Vec<RouteAd> {
    let mut ads = Vec::new();
    for entry in csv.split(';') {
        if entry.is_empty() {
            continue;
        }
        let fields: Vec<&str> = entry.split(':').collect();
        if fields.len() < 2 {
            continue;
        }
        let hop = match fields[1].parse::<u32>() {
            Ok(hop) => hop,
            Err(_) => continue,
        };
        let quality = fields
            .get(2)
            .and_then(|q| q.parse::<f64>().ok())
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);
        ads.push(RouteAd {
            dest_bbs: fields[0].to_string(),
            hop,
            quality,
        });
    }
    ads
}

/// Build our route table advertisement.
pub fn build_routes_csv(conn: &Connection, my_callsign: &str, now_us: i64) -> DbResult<String> {
    let mut entries: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    entries.push(format!("{my_callsign}:0:1.0"));
    seen.push(my_callsign.to_uppercase());

    for peer in peers::advertisable(conn)? {
        if let Some(callsign) = peer.wire_callsign() {
            let upper = callsign.to_uppercase();
            if seen.contains(&upper) {
                continue;
            }
            entries.push(format!("{callsign}:1:{:.2}", peer.quality_score));
            seen.push(upper);
        }
    }

    for route in routes::list_active(conn, now_us)? {
        let upper = route.dest_bbs.to_uppercase();
        if seen.contains(&upper) {
            continue;
        }
        entries.push(format!(
            "{}:{}:{:.2}",
            route.dest_bbs, route.hop_count, route.quality_score
        ));
        seen.push(upper);
    }

    Ok(entries.join(";"))
}

/// Ingest a peer's advertisement into the learned route table.
///
/// Each entry's effective hop count is the advertised hop plus one (the hop
/// through the advertising peer). Our own callsign and anything past the
/// hop cap are skipped. Returns the number of rows upserted.
#[allow(clippy::too_many_arguments)]
pub fn ingest(
    conn: &Connection,
    via_peer_id: i64,
    ads: &[RouteAd],
    my_callsign: &str,
    max_hops: u32,
    now_us: i64,
    expires_at_us: i64,
) -> DbResult<usize> {
    let mut stored = 0;
    for ad in ads {
        if ad.dest_bbs.eq_ignore_ascii_case(my_callsign) {
            continue;
        }
        let effective_hop = ad.hop + 1;
        if effective_hop > max_hops {
            continue;
        }
        routes::upsert(
            conn,
            &ad.dest_bbs,
            via_peer_id,
            effective_hop,
            ad.quality,
            now_us,
            expires_at_us,
        )?;
        stored += 1;
    }
    Ok(stored)
}

/// A selected next hop.
#[derive(Clone, Debug, PartialEq)]
pub struct NextHop {
    pub via_node_id: String,
    pub hop_count: u32,
    pub quality: f64,
}

/// Choose the next hop toward a destination BBS.
///
/// A direct peer whose callsign matches wins outright (when its health is
/// routable); otherwise the learned table picks the smallest hop count,
/// ties broken by quality.
pub fn find_next_hop(conn: &Connection, dest_bbs: &str, now_us: i64) -> DbResult<Option<NextHop>> {
    if let Some(peer) = peers::get_by_callsign(conn, dest_bbs)? {
        if peer.health.routable() && peer.sync_enabled {
            return Ok(Some(NextHop {
                via_node_id: peer.node_id,
                hop_count: 1,
                quality: peer.quality_score,
            }));
        }
    }

    Ok(routes::best(conn, dest_bbs, now_us)?.map(|choice| NextHop {
        via_node_id: choice.via_node_id,
        hop_count: choice.hop_count,
        quality: choice.quality_score,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vireo_db::queries::peers as peer_queries;
    use vireo_types::health::PeerHealth;

    fn test_db() -> Connection {
        vireo_db::open_memory().expect("open test db")
    }

    fn make_peer(conn: &Connection, node_id: &str, callsign: &str) -> i64 {
        peer_queries::upsert_configured(conn, node_id, callsign, "advbbs", true, 1000)
            .expect("peer")
            .id
    }

    #[test]
    fn test_parse_routes_csv() {
        let ads = parse_routes_csv("MV51:0:1.0;GL42:1:0.90;ZZ90:2:0.50");
        assert_eq!(ads.len(), 3);
        assert_eq!(ads[1].dest_bbs, "GL42");
        assert_eq!(ads[1].hop, 1);
        assert!((ads[1].quality - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_parse_skips_garbage_and_clamps() {
        let ads = parse_routes_csv("GOOD:1:0.5;;BAD;ALSO:x:1.0;HOT:2:7.5");
        assert_eq!(ads.len(), 2);
        assert_eq!(ads[0].dest_bbs, "GOOD");
        assert_eq!(ads[1].dest_bbs, "HOT");
        assert_eq!(ads[1].quality, 1.0);
    }

    #[test]
    fn test_build_advertisement() {
        let conn = test_db();
        let peer = make_peer(&conn, "!p1", "MV51");
        routes::upsert(&conn, "GL42", peer, 2, 0.9, 1000, 100_000).expect("route");

        let csv = build_routes_csv(&conn, "ADV", 2000).expect("build");
        assert_eq!(csv, "ADV:0:1.0;MV51:1:1.00;GL42:2:0.90");
    }

    #[test]
    fn test_advertisement_dedups_destinations() {
        let conn = test_db();
        let peer = make_peer(&conn, "!p1", "MV51");
        // A learned route to a BBS we already list as a direct peer.
        routes::upsert(&conn, "MV51", peer, 2, 0.5, 1000, 100_000).expect("route");

        let csv = build_routes_csv(&conn, "ADV", 2000).expect("build");
        assert_eq!(csv, "ADV:0:1.0;MV51:1:1.00");
    }

    #[test]
    fn test_ingest_adds_hop_and_caps() {
        let conn = test_db();
        let peer = make_peer(&conn, "!p1", "MV51");
        let ads = parse_routes_csv("MV51:0:1.0;GL42:1:0.90;FAR1:4:0.80;TOOFAR:5:0.80;ADV:1:1.0");

        let stored = ingest(&conn, peer, &ads, "ADV", 5, 2000, 100_000).expect("ingest");
        // MV51 (hop 1), GL42 (hop 2), FAR1 (hop 5); TOOFAR would be hop 6,
        // ADV is us.
        assert_eq!(stored, 3);

        let all = routes::list_active(&conn, 3000).expect("list");
        let gl42 = all.iter().find(|r| r.dest_bbs == "GL42").expect("GL42");
        assert_eq!(gl42.hop_count, 2);
        assert!(all.iter().all(|r| !r.dest_bbs.eq_ignore_ascii_case("ADV")));
    }

    #[test]
    fn test_next_hop_prefers_direct_peer() {
        let conn = test_db();
        let direct = make_peer(&conn, "!direct", "MV51");
        let other = make_peer(&conn, "!other", "XR20");
        let _ = direct;
        // A learned route to MV51 via the other peer, with a better hop
        // count than it could ever have — direct still wins.
        routes::upsert(&conn, "MV51", other, 2, 1.0, 1000, 100_000).expect("route");

        let hop = find_next_hop(&conn, "MV51", 2000).expect("find").expect("some");
        assert_eq!(hop.via_node_id, "!direct");
        assert_eq!(hop.hop_count, 1);
    }

    #[test]
    fn test_next_hop_falls_back_to_learned() {
        let conn = test_db();
        let peer = make_peer(&conn, "!p1", "MV51");
        routes::upsert(&conn, "GL42", peer, 2, 0.9, 1000, 100_000).expect("route");

        let hop = find_next_hop(&conn, "GL42", 2000).expect("find").expect("some");
        assert_eq!(hop.via_node_id, "!p1");
        assert_eq!(hop.hop_count, 2);

        assert!(find_next_hop(&conn, "NOPE", 2000).expect("find").is_none());
    }

    #[test]
    fn test_next_hop_skips_dead_direct_peer() {
        let conn = test_db();
        let direct = make_peer(&conn, "!direct", "MV51");
        peer_queries::record_heartbeat_failure(&conn, direct, 5, PeerHealth::Dead)
            .expect("dead");

        assert!(find_next_hop(&conn, "MV51", 2000).expect("find").is_none());
    }
}
