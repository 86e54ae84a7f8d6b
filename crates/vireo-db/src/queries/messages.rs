//! Message query functions.
//!
//! One table carries all three message kinds. Remote mail shares it with a
//! distinguishing convention in `forwarded_to`:
//!
//! - inbound, delivered here: `origin_bbs` set and `forwarded_to` is the
//!   original sender as `user@BBS`
//! - outbound, in transit: `forwarded_to` is `sender@SRC>recipient@DST` and
//!   there is no local recipient

use rusqlite::{Connection, OptionalExtension};

use vireo_types::addr;
use vireo_types::message::MessageType;

use crate::{is_unique_violation, not_found, DbError, Result};

/// A message row.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub uuid: String,
    pub msg_type: MessageType,
    pub board_id: Option<i64>,
    pub sender_user_id: Option<i64>,
    pub sender_node_id: Option<i64>,
    pub recipient_user_id: Option<i64>,
    pub recipient_node_id: Option<i64>,
    pub subject_enc: Option<Vec<u8>>,
    pub body_enc: Vec<u8>,
    pub created_at_us: i64,
    pub delivered_at_us: Option<i64>,
    pub read_at_us: Option<i64>,
    pub expires_at_us: Option<i64>,
    pub origin_bbs: Option<String>,
    pub delivery_attempts: u32,
    pub last_attempt_us: Option<i64>,
    pub forwarded_to: Option<String>,
    pub hop_count: u32,
}

impl MessageRow {
    /// Inbound remote mail: stored as the peer delivered it (plaintext
    /// body), original sender encoded in `forwarded_to` as `user@BBS`.
    pub fn is_remote_inbound(&self) -> bool {
        match (&self.origin_bbs, &self.forwarded_to) {
            (Some(_), Some(fwd)) => fwd.contains('@') && !addr::is_transit_addr(fwd),
            _ => false,
        }
    }

    /// Outbound remote mail still in transit from this BBS.
    pub fn is_remote_outbound(&self) -> bool {
        self.recipient_user_id.is_none()
            && self
                .forwarded_to
                .as_deref()
                .is_some_and(addr::is_transit_addr)
    }
}

/// Outcome of an insert keyed by UUID.
#[derive(Debug)]
pub enum CreateOutcome {
    Inserted(MessageRow),
    /// The UUID already exists; nothing was written. Callers on the
    /// protocol paths still acknowledge so the far side stops retrying.
    Duplicate,
}

impl CreateOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreateOutcome::Duplicate)
    }
}

/// Fields for a new message. Optional fields default to NULL.
#[derive(Default)]
pub struct NewMessage<'a> {
    pub uuid: Option<&'a str>,
    pub msg_type: Option<MessageType>,
    pub board_id: Option<i64>,
    pub sender_user_id: Option<i64>,
    pub sender_node_id: Option<i64>,
    pub recipient_user_id: Option<i64>,
    pub recipient_node_id: Option<i64>,
    pub subject_enc: Option<&'a [u8]>,
    pub body_enc: &'a [u8],
    pub origin_bbs: Option<&'a str>,
    pub expires_at_us: Option<i64>,
    pub forwarded_to: Option<&'a str>,
    pub hop_count: u32,
}

const COLUMNS: &str = "id, uuid, msg_type, board_id, sender_user_id, sender_node_id, \
                       recipient_user_id, recipient_node_id, subject_enc, body_enc, \
                       created_at_us, delivered_at_us, read_at_us, expires_at_us, origin_bbs, \
                       delivery_attempts, last_attempt_us, forwarded_to, hop_count";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let type_str: String = row.get(2)?;
    let msg_type = MessageType::parse(&type_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        )
    })?;
    Ok(MessageRow {
        id: row.get(0)?,
        uuid: row.get(1)?,
        msg_type,
        board_id: row.get(3)?,
        sender_user_id: row.get(4)?,
        sender_node_id: row.get(5)?,
        recipient_user_id: row.get(6)?,
        recipient_node_id: row.get(7)?,
        subject_enc: row.get(8)?,
        body_enc: row.get(9)?,
        created_at_us: row.get(10)?,
        delivered_at_us: row.get(11)?,
        read_at_us: row.get(12)?,
        expires_at_us: row.get(13)?,
        origin_bbs: row.get(14)?,
        delivery_attempts: row.get(15)?,
        last_attempt_us: row.get(16)?,
        forwarded_to: row.get(17)?,
        hop_count: row.get(18)?,
    })
}

/// Create a message, assigning a fresh UUID when none was supplied.
///
/// Atomic, and idempotent on UUID: re-inserting a known UUID returns
/// [`CreateOutcome::Duplicate`] without touching the table.
pub fn create(conn: &Connection, msg: &NewMessage<'_>, now_us: i64) -> Result<CreateOutcome> {
    let generated;
    let uuid = match msg.uuid {
        Some(uuid) => uuid,
        None => {
            generated = uuid::Uuid::new_v4().to_string();
            &generated
        }
    };
    let msg_type = msg.msg_type.unwrap_or(MessageType::Mail);

    let insert = conn.execute(
        "INSERT INTO messages (
            uuid, msg_type, board_id, sender_user_id, sender_node_id,
            recipient_user_id, recipient_node_id, subject_enc, body_enc,
            created_at_us, origin_bbs, expires_at_us, forwarded_to, hop_count
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        rusqlite::params![
            uuid,
            msg_type.as_str(),
            msg.board_id,
            msg.sender_user_id,
            msg.sender_node_id,
            msg.recipient_user_id,
            msg.recipient_node_id,
            msg.subject_enc,
            msg.body_enc,
            now_us,
            msg.origin_bbs,
            msg.expires_at_us,
            msg.forwarded_to,
            msg.hop_count,
        ],
    );

    match insert {
        Ok(_) => Ok(CreateOutcome::Inserted(get_by_id(
            conn,
            conn.last_insert_rowid(),
        )?)),
        Err(e) if is_unique_violation(&e) => Ok(CreateOutcome::Duplicate),
        Err(e) => Err(DbError::Sqlite(e)),
    }
}

/// Get a message by database id.
pub fn get_by_id(conn: &Connection, id: i64) -> Result<MessageRow> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
        [id],
        row_to_message,
    )
    .map_err(not_found("message"))
}

/// Get a message by UUID.
pub fn get_by_uuid(conn: &Connection, uuid: &str) -> Result<Option<MessageRow>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM messages WHERE uuid = ?1"),
        [uuid],
        row_to_message,
    )
    .optional()
    .map_err(DbError::Sqlite)
}

/// Whether a UUID is already stored (for deduplication).
pub fn exists(conn: &Connection, uuid: &str) -> Result<bool> {
    let row: Option<i64> = conn
        .query_row("SELECT 1 FROM messages WHERE uuid = ?1", [uuid], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(row.is_some())
}

/// Mail addressed to a user, newest first. System notices share the inbox.
pub fn user_mail(
    conn: &Connection,
    user_id: i64,
    unread_only: bool,
    limit: i64,
    offset: i64,
) -> Result<Vec<MessageRow>> {
    let unread_clause = if unread_only { "AND read_at_us IS NULL" } else { "" };
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM messages
         WHERE recipient_user_id = ?1 AND msg_type IN ('mail', 'system') {unread_clause}
         ORDER BY created_at_us DESC LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![user_id, limit, offset], row_to_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Count unread mail for a user.
pub fn count_unread(conn: &Connection, user_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE recipient_user_id = ?1 AND msg_type IN ('mail', 'system')
           AND read_at_us IS NULL",
        [user_id],
        |row| row.get(0),
    )
    .map_err(DbError::Sqlite)
}

/// Count all mail for a user.
pub fn count_mail(conn: &Connection, user_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE recipient_user_id = ?1 AND msg_type IN ('mail', 'system')",
        [user_id],
        |row| row.get(0),
    )
    .map_err(DbError::Sqlite)
}

/// Mark a message as read.
pub fn mark_read(conn: &Connection, id: i64, now_us: i64) -> Result<()> {
    conn.execute(
        "UPDATE messages SET read_at_us = ?1 WHERE id = ?2",
        rusqlite::params![now_us, id],
    )?;
    Ok(())
}

/// Mark a message as delivered.
pub fn mark_delivered(conn: &Connection, id: i64, now_us: i64) -> Result<()> {
    conn.execute(
        "UPDATE messages SET delivered_at_us = ?1 WHERE id = ?2",
        rusqlite::params![now_us, id],
    )?;
    Ok(())
}

/// Record a delivery attempt. The forwarding variant also bumps the hop
/// count.
pub fn update_delivery_attempt(
    conn: &Connection,
    id: i64,
    now_us: i64,
    forwarded_to: Option<&str>,
) -> Result<()> {
    match forwarded_to {
        Some(dest) => conn.execute(
            "UPDATE messages
             SET delivery_attempts = delivery_attempts + 1,
                 last_attempt_us = ?1,
                 forwarded_to = ?2,
                 hop_count = hop_count + 1
             WHERE id = ?3",
            rusqlite::params![now_us, dest, id],
        )?,
        None => conn.execute(
            "UPDATE messages
             SET delivery_attempts = delivery_attempts + 1, last_attempt_us = ?1
             WHERE id = ?2",
            rusqlite::params![now_us, id],
        )?,
    };
    Ok(())
}

/// Mail rows still awaiting local delivery.
///
/// Excludes remote queued mail (no sender node) — that flows through the
/// remote-mail protocol instead.
pub fn pending_deliveries(conn: &Connection, limit: i64) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM messages
         WHERE msg_type = 'mail'
         AND delivered_at_us IS NULL
         AND delivery_attempts < 3
         AND hop_count < 3
         AND sender_node_id IS NOT NULL
         ORDER BY created_at_us
         LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map([limit], row_to_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Bulletins on a board, in per-board timestamp order.
pub fn board_messages(
    conn: &Connection,
    board_id: i64,
    since_us: Option<i64>,
    limit: i64,
    ascending: bool,
) -> Result<Vec<MessageRow>> {
    let since_clause = if since_us.is_some() { "AND created_at_us > ?2" } else { "" };
    let order = if ascending { "ASC" } else { "DESC" };
    let sql = format!(
        "SELECT {COLUMNS} FROM messages
         WHERE board_id = ?1 AND msg_type = 'bulletin' {since_clause}
         ORDER BY created_at_us {order} LIMIT {limit}"
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = match since_us {
        Some(since) => stmt
            .query_map(rusqlite::params![board_id, since], row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
        None => stmt
            .query_map([board_id], row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };
    Ok(rows)
}

/// Count bulletins on a board.
pub fn count_board_messages(conn: &Connection, board_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE board_id = ?1 AND msg_type = 'bulletin'",
        [board_id],
        |row| row.get(0),
    )
    .map_err(DbError::Sqlite)
}

/// Delete a message.
pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
    Ok(n > 0)
}

/// Physically remove expired rows. Returns the count removed.
pub fn delete_expired(conn: &Connection, now_us: i64) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM messages WHERE expires_at_us IS NOT NULL AND expires_at_us < ?1",
        [now_us],
    )?;
    if n > 0 {
        tracing::info!("Deleted {n} expired messages");
    }
    Ok(n)
}

/// Store mail received from a remote BBS for a local recipient.
///
/// Idempotent: a known UUID returns [`CreateOutcome::Duplicate`] so the
/// caller still emits its delivery confirmation without double-storing.
pub fn create_incoming_remote_mail(
    conn: &Connection,
    uuid: &str,
    from_user: &str,
    from_bbs: &str,
    to_user_id: i64,
    body: &str,
    now_us: i64,
    expires_at_us: i64,
) -> Result<CreateOutcome> {
    let sender_info = format!("{from_user}@{from_bbs}");
    create(
        conn,
        &NewMessage {
            uuid: Some(uuid),
            msg_type: Some(MessageType::Mail),
            recipient_user_id: Some(to_user_id),
            body_enc: body.as_bytes(),
            origin_bbs: Some(from_bbs),
            forwarded_to: Some(&sender_info),
            expires_at_us: Some(expires_at_us),
            ..NewMessage::default()
        },
        now_us,
    )
}

/// Queue an outbound remote mail.
///
/// The body is stored in plaintext — the receiving BBS encrypts it for its
/// local recipient; the radio layer may provide its own link encryption.
#[allow(clippy::too_many_arguments)]
pub fn create_remote_outbound(
    conn: &Connection,
    uuid: &str,
    sender_username: &str,
    sender_bbs: &str,
    sender_node_id: i64,
    recipient_username: &str,
    recipient_bbs: &str,
    body: &str,
    now_us: i64,
) -> Result<CreateOutcome> {
    let transit = format!("{sender_username}@{sender_bbs}>{recipient_username}@{recipient_bbs}");
    create(
        conn,
        &NewMessage {
            uuid: Some(uuid),
            msg_type: Some(MessageType::Mail),
            sender_node_id: Some(sender_node_id),
            body_enc: body.as_bytes(),
            origin_bbs: Some(sender_bbs),
            forwarded_to: Some(&transit),
            ..NewMessage::default()
        },
        now_us,
    )
}

/// Mark an outbound remote mail as confirmed delivered.
pub fn mark_remote_delivered(conn: &Connection, uuid: &str, dest: &str, now_us: i64) -> Result<()> {
    conn.execute(
        "UPDATE messages SET delivered_at_us = ?1, forwarded_to = ?2 WHERE uuid = ?3",
        rusqlite::params![now_us, format!("DELIVERED:{dest}"), uuid],
    )?;
    Ok(())
}

/// Mark an outbound remote mail as terminally failed.
pub fn mark_remote_failed(conn: &Connection, uuid: &str, reason: &str) -> Result<()> {
    conn.execute(
        "UPDATE messages SET delivery_attempts = 99, forwarded_to = ?1 WHERE uuid = ?2",
        rusqlite::params![format!("FAILED:{reason}"), uuid],
    )?;
    Ok(())
}

/// Delivery status of a sent remote mail, derived from its markers.
#[derive(Debug, Clone)]
pub struct SentRemoteRow {
    pub id: i64,
    pub uuid: String,
    pub destination: String,
    pub status: SentRemoteStatus,
    pub created_at_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentRemoteStatus {
    Pending,
    Delivered,
    Failed,
}

/// Outbound remote mail sent by a user, newest first, with derived status.
pub fn sent_remote(conn: &Connection, username: &str, limit: i64) -> Result<Vec<SentRemoteRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, uuid, forwarded_to, delivered_at_us, delivery_attempts, created_at_us
         FROM messages
         WHERE msg_type = 'mail' AND forwarded_to LIKE ?1
         ORDER BY created_at_us DESC
         LIMIT ?2",
    )?;

    let pattern = format!("{username}@%>%");
    let rows = stmt
        .query_map(rusqlite::params![pattern, limit], |row| {
            let forwarded: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
            let delivered: Option<i64> = row.get(3)?;
            let attempts: i64 = row.get(4)?;

            let destination = forwarded
                .split_once('>')
                .map(|(_, dest)| dest.to_string())
                .unwrap_or_else(|| forwarded.clone());

            let status = if delivered.is_some() {
                SentRemoteStatus::Delivered
            } else if forwarded.contains("FAILED:") || attempts >= 3 {
                SentRemoteStatus::Failed
            } else {
                SentRemoteStatus::Pending
            };

            Ok(SentRemoteRow {
                id: row.get(0)?,
                uuid: row.get(1)?,
                destination,
                status,
                created_at_us: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
