//! Node and user-node association queries.
//!
//! Nodes are radio endpoints, auto-created on first sight. The user-node
//! association doubles as a weak second factor: a user may only
//! authenticate from a node linked to their account.

use rusqlite::{Connection, OptionalExtension};

use crate::{not_found, DbError, Result};

/// A node row.
#[derive(Debug, Clone)]
pub struct NodeRow {
    pub id: i64,
    /// External radio identity, opaque to the core (shaped like `!hex8`).
    pub node_id: String,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub first_seen_us: i64,
    pub last_seen_us: i64,
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        id: row.get(0)?,
        node_id: row.get(1)?,
        short_name: row.get(2)?,
        long_name: row.get(3)?,
        first_seen_us: row.get(4)?,
        last_seen_us: row.get(5)?,
    })
}

const COLUMNS: &str = "id, node_id, short_name, long_name, first_seen_us, last_seen_us";

/// Look up a node by its external identity string.
pub fn get_by_node_id(conn: &Connection, node_id: &str) -> Result<Option<NodeRow>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM nodes WHERE node_id = ?1"),
        [node_id],
        row_to_node,
    )
    .optional()
    .map_err(DbError::Sqlite)
}

/// Look up a node by database id.
pub fn get_by_id(conn: &Connection, id: i64) -> Result<NodeRow> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM nodes WHERE id = ?1"),
        [id],
        row_to_node,
    )
    .map_err(not_found("node"))
}

/// Fetch or auto-create a node, updating its last-seen time either way.
pub fn get_or_create(conn: &Connection, node_id: &str, now_us: i64) -> Result<NodeRow> {
    if let Some(node) = get_by_node_id(conn, node_id)? {
        conn.execute(
            "UPDATE nodes SET last_seen_us = ?1 WHERE id = ?2",
            rusqlite::params![now_us, node.id],
        )?;
        return Ok(NodeRow {
            last_seen_us: now_us,
            ..node
        });
    }

    conn.execute(
        "INSERT INTO nodes (node_id, first_seen_us, last_seen_us) VALUES (?1, ?2, ?2)",
        rusqlite::params![node_id, now_us],
    )?;
    get_by_id(conn, conn.last_insert_rowid())
}

/// Update display names reported by the radio layer.
pub fn update_names(
    conn: &Connection,
    id: i64,
    short_name: Option<&str>,
    long_name: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE nodes SET short_name = ?1, long_name = ?2 WHERE id = ?3",
        rusqlite::params![short_name, long_name, id],
    )?;
    Ok(())
}

/// Link a node to a user. Re-linking updates the primary flag.
pub fn link_user(
    conn: &Connection,
    user_id: i64,
    node_db_id: i64,
    primary: bool,
    now_us: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO user_nodes (user_id, node_id, is_primary, linked_at_us)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id, node_id) DO UPDATE SET is_primary = excluded.is_primary",
        rusqlite::params![user_id, node_db_id, primary, now_us],
    )?;
    Ok(())
}

/// Remove a user-node association.
pub fn unlink_user(conn: &Connection, user_id: i64, node_db_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM user_nodes WHERE user_id = ?1 AND node_id = ?2",
        rusqlite::params![user_id, node_db_id],
    )?;
    Ok(())
}

/// External node identities associated with a user, primary first.
pub fn user_node_ids(conn: &Connection, user_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT n.node_id FROM user_nodes un
         JOIN nodes n ON n.id = un.node_id
         WHERE un.user_id = ?1
         ORDER BY un.is_primary DESC, un.linked_at_us",
    )?;
    let rows = stmt
        .query_map([user_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(rows)
}

/// Whether a user may authenticate from the given node.
pub fn is_associated(conn: &Connection, user_id: i64, node_db_id: i64) -> Result<bool> {
    let row: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM user_nodes WHERE user_id = ?1 AND node_id = ?2",
            rusqlite::params![user_id, node_db_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::users::{self, NewUser};

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    fn make_user(conn: &Connection, name: &str) -> i64 {
        users::create(
            conn,
            &NewUser {
                username: name,
                password_hash: b"h",
                salt: b"s",
                enc_key_password: b"kp",
                enc_key_master: b"km",
            },
            1000,
        )
        .expect("create user")
        .id
    }

    #[test]
    fn test_auto_create_on_first_sight() {
        let conn = test_db();
        let node = get_or_create(&conn, "!a1b2c3d4", 1000).expect("create");
        assert_eq!(node.node_id, "!a1b2c3d4");
        assert_eq!(node.first_seen_us, 1000);

        // Second sight updates last_seen only.
        let again = get_or_create(&conn, "!a1b2c3d4", 2000).expect("get");
        assert_eq!(again.id, node.id);
        assert_eq!(again.first_seen_us, 1000);
        assert_eq!(again.last_seen_us, 2000);
    }

    #[test]
    fn test_user_node_association() {
        let conn = test_db();
        let user_id = make_user(&conn, "alice");
        let n1 = get_or_create(&conn, "!node0001", 1000).expect("create");
        let n2 = get_or_create(&conn, "!node0002", 1001).expect("create");

        link_user(&conn, user_id, n1.id, false, 1002).expect("link");
        link_user(&conn, user_id, n2.id, true, 1003).expect("link");

        let ids = user_node_ids(&conn, user_id).expect("list");
        // Primary node sorts first.
        assert_eq!(ids, vec!["!node0002".to_string(), "!node0001".to_string()]);

        assert!(is_associated(&conn, user_id, n1.id).expect("check"));
        unlink_user(&conn, user_id, n1.id).expect("unlink");
        assert!(!is_associated(&conn, user_id, n1.id).expect("check"));
    }
}
