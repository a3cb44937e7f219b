//! Materialized entry rows.
//!
//! Writes that replace attributes are conditioned on the `transaction_id` the
//! caller observed (compare-and-swap). A `false` return means another writer
//! got there first and the caller should recompute and retry.

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::conversion_error;
use crate::error::Result;
use crate::types::{Entry, from_millis, to_millis};

const COLUMNS: &str =
    "id, root_id, attributes, created_at, created_by, updated_at, updated_by, transaction_id";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let attributes: String = row.get(2)?;
    let attributes = serde_json::from_str(&attributes).map_err(|e| conversion_error(2, e))?;
    let updated_at: Option<i64> = row.get(5)?;

    Ok(Entry {
        id: row.get(0)?,
        root_id: row.get(1)?,
        attributes,
        created_at: from_millis(row.get(3)?),
        created_by: row.get(4)?,
        updated_at: updated_at.map(from_millis),
        updated_by: row.get(6)?,
        transaction_id: row.get(7)?,
    })
}

/// Insert a new entry. Returns `false` if an entry with the same id exists.
pub fn insert(conn: &Connection, entry: &Entry) -> Result<bool> {
    let attributes = serde_json::to_string(&entry.attributes)?;
    let rows = conn.execute(
        &format!(
            "INSERT INTO entries ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING"
        ),
        params![
            entry.id,
            entry.root_id,
            attributes,
            to_millis(&entry.created_at),
            entry.created_by,
            entry.updated_at.as_ref().map(to_millis),
            entry.updated_by,
            entry.transaction_id,
        ],
    )?;
    Ok(rows == 1)
}

/// Fetch an entry by id.
pub fn get(conn: &Connection, id: &str) -> Result<Option<Entry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM entries WHERE id = ?"),
            params![id],
            from_row,
        )
        .optional()?;
    Ok(entry)
}

/// All entries under a root (the root included), ordered by id.
pub fn list_by_root(conn: &Connection, root_id: &str) -> Result<Vec<Entry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM entries WHERE root_id = ? ORDER BY id ASC"
    ))?;
    let entries = stmt
        .query_map(params![root_id], from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Replace the mutable fields of `entry` if its stored token is still
/// `expected_transaction_id`.
pub fn update_cas(conn: &Connection, entry: &Entry, expected_transaction_id: &str) -> Result<bool> {
    let attributes = serde_json::to_string(&entry.attributes)?;
    let rows = conn.execute(
        "UPDATE entries
         SET attributes = ?, updated_at = ?, updated_by = ?, transaction_id = ?
         WHERE id = ? AND transaction_id = ?",
        params![
            attributes,
            entry.updated_at.as_ref().map(to_millis),
            entry.updated_by,
            entry.transaction_id,
            entry.id,
            expected_transaction_id,
        ],
    )?;
    Ok(rows == 1)
}

/// Write `entry` back after its delete was reverted.
///
/// Inserts the row if absent. If a row exists it is only overwritten when it
/// still carries `reverted_transaction_id`, so an entry recreated since the
/// delete is left alone. Returns whether a row was written.
pub fn restore(conn: &Connection, entry: &Entry, reverted_transaction_id: &str) -> Result<bool> {
    let attributes = serde_json::to_string(&entry.attributes)?;
    let rows = conn.execute(
        &format!(
            "INSERT INTO entries ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 attributes = excluded.attributes,
                 updated_at = excluded.updated_at,
                 updated_by = excluded.updated_by,
                 transaction_id = excluded.transaction_id
             WHERE entries.transaction_id = ?"
        ),
        params![
            entry.id,
            entry.root_id,
            attributes,
            to_millis(&entry.created_at),
            entry.created_by,
            entry.updated_at.as_ref().map(to_millis),
            entry.updated_by,
            entry.transaction_id,
            reverted_transaction_id,
        ],
    )?;
    Ok(rows == 1)
}

/// Delete an entry row. Returns whether a row existed.
pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let rows = conn.execute("DELETE FROM entries WHERE id = ?", params![id])?;
    Ok(rows == 1)
}
