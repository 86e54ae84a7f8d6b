//! User query functions.

use rusqlite::{Connection, OptionalExtension};

use crate::{is_unique_violation, not_found, DbError, Result};

/// A user row.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub password_hash: Vec<u8>,
    pub salt: Vec<u8>,
    /// Data key sealed to the password-derived key.
    pub enc_key_password: Vec<u8>,
    /// Data key sealed under the operator master key.
    pub enc_key_master: Vec<u8>,
    pub is_admin: bool,
    pub is_banned: bool,
    pub ban_reason: Option<String>,
    pub created_at_us: i64,
    pub last_seen_us: Option<i64>,
}

/// Fields for a new user.
pub struct NewUser<'a> {
    pub username: &'a str,
    pub password_hash: &'a [u8],
    pub salt: &'a [u8],
    pub enc_key_password: &'a [u8],
    pub enc_key_master: &'a [u8],
}

const COLUMNS: &str = "id, username, password_hash, salt, enc_key_password, enc_key_master, \
                       is_admin, is_banned, ban_reason, created_at_us, last_seen_us";

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        salt: row.get(3)?,
        enc_key_password: row.get(4)?,
        enc_key_master: row.get(5)?,
        is_admin: row.get(6)?,
        is_banned: row.get(7)?,
        ban_reason: row.get(8)?,
        created_at_us: row.get(9)?,
        last_seen_us: row.get(10)?,
    })
}

/// Create a new user. Duplicate usernames fail with
/// [`DbError::UniqueViolation`].
pub fn create(conn: &Connection, user: &NewUser<'_>, now_us: i64) -> Result<UserRow> {
    let insert = conn.execute(
        "INSERT INTO users (username, password_hash, salt, enc_key_password, enc_key_master, created_at_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            user.username,
            user.password_hash,
            user.salt,
            user.enc_key_password,
            user.enc_key_master,
            now_us,
        ],
    );

    match insert {
        Ok(_) => get_by_id(conn, conn.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => {
            Err(DbError::UniqueViolation(format!("username '{}'", user.username)))
        }
        Err(e) => Err(DbError::Sqlite(e)),
    }
}

/// Get a user by database id.
pub fn get_by_id(conn: &Connection, id: i64) -> Result<UserRow> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM users WHERE id = ?1"),
        [id],
        row_to_user,
    )
    .map_err(not_found("user"))
}

/// Get a user by username.
pub fn get_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM users WHERE username = ?1"),
        [username],
        row_to_user,
    )
    .optional()
    .map_err(DbError::Sqlite)
}

/// Ban or unban a user.
pub fn set_banned(conn: &Connection, id: i64, banned: bool, reason: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE users SET is_banned = ?1, ban_reason = ?2 WHERE id = ?3",
        rusqlite::params![banned, reason, id],
    )?;
    Ok(())
}

/// Grant or revoke admin.
pub fn set_admin(conn: &Connection, id: i64, admin: bool) -> Result<()> {
    conn.execute(
        "UPDATE users SET is_admin = ?1 WHERE id = ?2",
        rusqlite::params![admin, id],
    )?;
    Ok(())
}

/// Record activity.
pub fn touch_last_seen(conn: &Connection, id: i64, now_us: i64) -> Result<()> {
    conn.execute(
        "UPDATE users SET last_seen_us = ?1 WHERE id = ?2",
        rusqlite::params![now_us, id],
    )?;
    Ok(())
}

/// Rotate a user's password material: new verifier, new salt, and the data
/// key resealed under the new password-derived key. The master-sealed copy
/// is untouched, which is what makes the rotation possible at all.
pub fn update_password(
    conn: &Connection,
    id: i64,
    password_hash: &[u8],
    salt: &[u8],
    enc_key_password: &[u8],
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE users SET password_hash = ?1, salt = ?2, enc_key_password = ?3 WHERE id = ?4",
        rusqlite::params![password_hash, salt, enc_key_password, id],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound("user".into()));
    }
    Ok(())
}

/// Delete a user and every message they sent or received, in one
/// transaction.
pub fn delete_cascade(conn: &Connection, id: i64) -> Result<usize> {
    conn.execute_batch("BEGIN")?;
    let result = (|| -> Result<usize> {
        let messages = conn.execute(
            "DELETE FROM messages WHERE sender_user_id = ?1 OR recipient_user_id = ?1",
            [id],
        )?;
        conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
        Ok(messages)
    })();
    match result {
        Ok(n) => {
            conn.execute_batch("COMMIT")?;
            Ok(n)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Total registered users.
pub fn count(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
        .map_err(DbError::Sqlite)
}
