//! Append-only per-entry transaction log.
//!
//! Rows are only ever inserted, stamped with server fields, or removed (by a
//! revert or by a server-acknowledged delete). Listing is ordered by id, which
//! for time-sortable ids is creation order and therefore replay order.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::conversion_error;
use crate::error::Result;
use crate::types::{EntryTransaction, Operation, from_millis, to_millis};

const COLUMNS: &str =
    "id, entry_id, root_id, operation, data, created_at, created_by, version, server_created_at";

#[derive(Debug)]
struct UnknownOperation(String);

impl std::fmt::Display for UnknownOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UnknownOperation {}

fn from_row(row: &Row<'_>) -> rusqlite::Result<EntryTransaction> {
    let operation: String = row.get(3)?;
    let operation: Operation = operation
        .parse()
        .map_err(|e| conversion_error(3, UnknownOperation(e)))?;
    let server_created_at: Option<i64> = row.get(8)?;

    Ok(EntryTransaction {
        id: row.get(0)?,
        entry_id: row.get(1)?,
        root_id: row.get(2)?,
        operation,
        data: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        created_by: row.get(6)?,
        version: row.get(7)?,
        server_created_at: server_created_at.map(from_millis),
    })
}

/// Append a transaction.
pub fn insert(conn: &Connection, transaction: &EntryTransaction) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO entry_transactions ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"),
        params![
            transaction.id,
            transaction.entry_id,
            transaction.root_id,
            transaction.operation.to_string(),
            transaction.data,
            to_millis(&transaction.created_at),
            transaction.created_by,
            transaction.version,
            transaction.server_created_at.as_ref().map(to_millis),
        ],
    )?;
    Ok(())
}

/// Fetch a transaction by id.
pub fn get(conn: &Connection, id: &str) -> Result<Option<EntryTransaction>> {
    let transaction = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM entry_transactions WHERE id = ?"),
            params![id],
            from_row,
        )
        .optional()?;
    Ok(transaction)
}

/// The log of an entry in replay order.
pub fn list_for_entry(conn: &Connection, entry_id: &str) -> Result<Vec<EntryTransaction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM entry_transactions WHERE entry_id = ? ORDER BY id ASC"
    ))?;
    let transactions = stmt
        .query_map(params![entry_id], from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(transactions)
}

/// Record the server-assigned version and commit time.
pub fn stamp_server_fields(
    conn: &Connection,
    id: &str,
    version: i64,
    server_created_at: Option<&DateTime<Utc>>,
) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE entry_transactions SET version = ?, server_created_at = ? WHERE id = ?",
        params![version, server_created_at.map(to_millis), id],
    )?;
    Ok(rows == 1)
}

/// Remove one transaction. Returns whether it existed.
pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let rows = conn.execute("DELETE FROM entry_transactions WHERE id = ?", params![id])?;
    Ok(rows == 1)
}

/// Remove the whole log of an entry. Returns the number of rows removed.
pub fn delete_for_entry(conn: &Connection, entry_id: &str) -> Result<usize> {
    let rows = conn.execute(
        "DELETE FROM entry_transactions WHERE entry_id = ?",
        params![entry_id],
    )?;
    Ok(rows)
}
