//! Bulletin board queries.

use rusqlite::{Connection, OptionalExtension};

use vireo_types::ident;

use crate::{is_unique_violation, not_found, DbError, Result};

/// A board row.
#[derive(Debug, Clone)]
pub struct BoardRow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Login required to read.
    pub restricted: bool,
    /// Participates in inter-BBS bulletin sync.
    pub sync_enabled: bool,
    pub created_at_us: i64,
}

const COLUMNS: &str = "id, name, description, restricted, sync_enabled, created_at_us";

fn row_to_board(row: &rusqlite::Row<'_>) -> rusqlite::Result<BoardRow> {
    Ok(BoardRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        restricted: row.get(3)?,
        sync_enabled: row.get(4)?,
        created_at_us: row.get(5)?,
    })
}

/// Create a board. The name must pass the board-name shape rules.
pub fn create(
    conn: &Connection,
    name: &str,
    description: Option<&str>,
    restricted: bool,
    sync_enabled: bool,
    now_us: i64,
) -> Result<BoardRow> {
    ident::validate_board_name(name).map_err(|e| DbError::InvalidValue(e.to_string()))?;

    let insert = conn.execute(
        "INSERT INTO boards (name, description, restricted, sync_enabled, created_at_us)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![name, description, restricted, sync_enabled, now_us],
    );

    match insert {
        Ok(_) => get_by_id(conn, conn.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => {
            Err(DbError::UniqueViolation(format!("board '{name}'")))
        }
        Err(e) => Err(DbError::Sqlite(e)),
    }
}

/// Get a board by database id.
pub fn get_by_id(conn: &Connection, id: i64) -> Result<BoardRow> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM boards WHERE id = ?1"),
        [id],
        row_to_board,
    )
    .map_err(not_found("board"))
}

/// Get a board by name.
pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<BoardRow>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM boards WHERE name = ?1"),
        [name],
        row_to_board,
    )
    .optional()
    .map_err(DbError::Sqlite)
}

/// All boards, by name.
pub fn list(conn: &Connection) -> Result<Vec<BoardRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM boards ORDER BY name"))?;
    let rows = stmt
        .query_map([], row_to_board)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Boards participating in inter-BBS sync.
pub fn synced(conn: &Connection) -> Result<Vec<BoardRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM boards WHERE sync_enabled = 1 ORDER BY name"
    ))?;
    let rows = stmt
        .query_map([], row_to_board)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Toggle sync participation.
pub fn set_sync_enabled(conn: &Connection, id: i64, enabled: bool) -> Result<()> {
    conn.execute(
        "UPDATE boards SET sync_enabled = ?1 WHERE id = ?2",
        rusqlite::params![enabled, id],
    )?;
    Ok(())
}

/// Delete a board; its bulletins cascade.
pub fn delete(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn.execute("DELETE FROM boards WHERE id = ?1", [id])?;
    Ok(n > 0)
}
