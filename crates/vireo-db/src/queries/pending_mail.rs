//! Queued outbound remote mail.
//!
//! Remote mail that could not be sent (no route, or the route's peer was
//! down) waits here until the peer-health protocol reports the destination
//! reachable again, or until the row expires.

use rusqlite::Connection;

use crate::{DbError, Result};

/// A queued mail row.
#[derive(Debug, Clone)]
pub struct PendingMailRow {
    pub id: i64,
    pub mail_uuid: String,
    pub sender_user_id: Option<i64>,
    pub sender_username: String,
    pub sender_bbs: String,
    pub recipient_username: String,
    pub recipient_bbs: String,
    pub body: Vec<u8>,
    pub queued_at_us: i64,
    pub expires_at_us: i64,
    pub retry_count: u32,
    pub last_retry_us: Option<i64>,
    pub last_status: Option<String>,
}

fn row_to_pending(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingMailRow> {
    Ok(PendingMailRow {
        id: row.get(0)?,
        mail_uuid: row.get(1)?,
        sender_user_id: row.get(2)?,
        sender_username: row.get(3)?,
        sender_bbs: row.get(4)?,
        recipient_username: row.get(5)?,
        recipient_bbs: row.get(6)?,
        body: row.get(7)?,
        queued_at_us: row.get(8)?,
        expires_at_us: row.get(9)?,
        retry_count: row.get(10)?,
        last_retry_us: row.get(11)?,
        last_status: row.get(12)?,
    })
}

const COLUMNS: &str = "id, mail_uuid, sender_user_id, sender_username, sender_bbs, \
                       recipient_username, recipient_bbs, body, queued_at_us, expires_at_us, \
                       retry_count, last_retry_us, last_status";

/// Fields for a new queued mail.
pub struct NewPendingMail<'a> {
    pub mail_uuid: &'a str,
    pub sender_user_id: Option<i64>,
    pub sender_username: &'a str,
    pub sender_bbs: &'a str,
    pub recipient_username: &'a str,
    pub recipient_bbs: &'a str,
    pub body: &'a str,
    pub status: &'a str,
}

/// Queue a mail for later delivery. Re-queuing the same UUID replaces the
/// row and resets its retry counter.
pub fn queue(
    conn: &Connection,
    mail: &NewPendingMail<'_>,
    now_us: i64,
    expires_at_us: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO rap_pending_mail
         (mail_uuid, sender_user_id, sender_username, sender_bbs,
          recipient_username, recipient_bbs, body,
          queued_at_us, expires_at_us, retry_count, last_status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
        rusqlite::params![
            mail.mail_uuid,
            mail.sender_user_id,
            mail.sender_username,
            mail.sender_bbs,
            mail.recipient_username,
            mail.recipient_bbs,
            mail.body.as_bytes(),
            now_us,
            expires_at_us,
            mail.status,
        ],
    )?;
    Ok(())
}

/// Unexpired queued mail for any of the given destination callsigns
/// (matched case-insensitively).
pub fn for_destinations(
    conn: &Connection,
    dests: &[String],
    now_us: i64,
) -> Result<Vec<PendingMailRow>> {
    if dests.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = (0..dests.len())
        .map(|i| format!("?{}", i + 2))
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT {COLUMNS} FROM rap_pending_mail
         WHERE UPPER(recipient_bbs) IN ({placeholders}) AND expires_at_us > ?1
         ORDER BY queued_at_us"
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now_us)];
    for dest in dests {
        params.push(Box::new(dest.to_uppercase()));
    }
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), row_to_pending)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Queued mail whose expiry has passed.
pub fn expired(conn: &Connection, now_us: i64) -> Result<Vec<PendingMailRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM rap_pending_mail WHERE expires_at_us < ?1"
    ))?;
    let rows = stmt
        .query_map([now_us], row_to_pending)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Delete a queued mail (delivered or expired).
pub fn delete(conn: &Connection, mail_uuid: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM rap_pending_mail WHERE mail_uuid = ?1",
        [mail_uuid],
    )?;
    Ok(n > 0)
}

/// Record a failed redrive attempt.
pub fn record_retry(conn: &Connection, mail_uuid: &str, now_us: i64, status: &str) -> Result<()> {
    conn.execute(
        "UPDATE rap_pending_mail
         SET retry_count = retry_count + 1, last_retry_us = ?1, last_status = ?2
         WHERE mail_uuid = ?3",
        rusqlite::params![now_us, status, mail_uuid],
    )?;
    Ok(())
}

/// Count queued mail.
pub fn count(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM rap_pending_mail", [], |row| row.get(0))
        .map_err(DbError::Sqlite)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    fn sample(uuid: &str, dest: &str) -> NewPendingMail<'static> {
        // Leak is fine in tests; keeps the helper signature simple.
        NewPendingMail {
            mail_uuid: Box::leak(uuid.to_string().into_boxed_str()),
            sender_user_id: Some(1),
            sender_username: "alice",
            sender_bbs: "ADV",
            recipient_username: "carol",
            recipient_bbs: Box::leak(dest.to_string().into_boxed_str()),
            body: "hello",
            status: "no_route",
        }
    }

    #[test]
    fn test_queue_and_fetch_by_destination() {
        let conn = test_db();
        queue(&conn, &sample("u-1", "GL42"), 1000, 10_000).expect("queue");
        queue(&conn, &sample("u-2", "GL42"), 1100, 10_000).expect("queue");
        queue(&conn, &sample("u-3", "ZZ90"), 1200, 10_000).expect("queue");

        let rows = for_destinations(&conn, &["gl42".to_string()], 2000).expect("fetch");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].mail_uuid, "u-1");
        assert_eq!(rows[1].mail_uuid, "u-2");
    }

    #[test]
    fn test_requeue_replaces() {
        let conn = test_db();
        queue(&conn, &sample("u-1", "GL42"), 1000, 10_000).expect("queue");
        record_retry(&conn, "u-1", 1500, "no_route").expect("retry");
        queue(&conn, &sample("u-1", "GL42"), 2000, 20_000).expect("requeue");

        let rows = for_destinations(&conn, &["GL42".to_string()], 3000).expect("fetch");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].retry_count, 0);
        assert_eq!(rows[0].queued_at_us, 2000);
    }

    #[test]
    fn test_expiry_visibility() {
        let conn = test_db();
        queue(&conn, &sample("u-1", "GL42"), 1000, 5000).expect("queue");

        assert!(for_destinations(&conn, &["GL42".to_string()], 6000)
            .expect("fetch")
            .is_empty());
        let expired_rows = expired(&conn, 6000).expect("expired");
        assert_eq!(expired_rows.len(), 1);
        assert_eq!(expired_rows[0].mail_uuid, "u-1");

        assert!(delete(&conn, "u-1").expect("delete"));
        assert!(expired(&conn, 6000).expect("expired").is_empty());
    }

    #[test]
    fn test_retry_bookkeeping() {
        let conn = test_db();
        queue(&conn, &sample("u-1", "GL42"), 1000, 10_000).expect("queue");
        record_retry(&conn, "u-1", 2000, "peer down").expect("retry");

        let rows = for_destinations(&conn, &["GL42".to_string()], 3000).expect("fetch");
        assert_eq!(rows[0].retry_count, 1);
        assert_eq!(rows[0].last_retry_us, Some(2000));
        assert_eq!(rows[0].last_status.as_deref(), Some("peer down"));
    }
}
