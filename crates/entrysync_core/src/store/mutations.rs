//! Durable outbox of operations destined for the server.

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::conversion_error;
use crate::error::Result;
use crate::types::{Mutation, MutationType, from_millis, to_millis};

const COLUMNS: &str = "id, mutation_type, data, created_at, retries";

#[derive(Debug)]
struct UnknownMutationType(String);

impl std::fmt::Display for UnknownMutationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UnknownMutationType {}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Mutation> {
    let mutation_type: String = row.get(1)?;
    let mutation_type: MutationType = mutation_type
        .parse()
        .map_err(|e| conversion_error(1, UnknownMutationType(e)))?;

    Ok(Mutation {
        id: row.get(0)?,
        mutation_type,
        data: row.get(2)?,
        created_at: from_millis(row.get(3)?),
        retries: row.get(4)?,
    })
}

/// Enqueue a mutation.
pub fn insert(conn: &Connection, mutation: &Mutation) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO mutations ({COLUMNS}) VALUES (?, ?, ?, ?, ?)"),
        params![
            mutation.id,
            mutation.mutation_type.to_string(),
            mutation.data,
            to_millis(&mutation.created_at),
            mutation.retries,
        ],
    )?;
    Ok(())
}

/// Oldest pending mutations first, at most `limit` of them.
pub fn list_pending(conn: &Connection, limit: usize) -> Result<Vec<Mutation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM mutations ORDER BY id ASC LIMIT ?"
    ))?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mutations = stmt
        .query_map(params![limit], from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(mutations)
}

/// Remove a mutation once it is settled. Returns whether it existed.
pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let rows = conn.execute("DELETE FROM mutations WHERE id = ?", params![id])?;
    Ok(rows == 1)
}

/// Count a transient failure. Returns the new retry count, or `None` if the
/// mutation no longer exists.
pub fn increment_retries(conn: &Connection, id: &str) -> Result<Option<u32>> {
    let retries = conn
        .query_row(
            "UPDATE mutations SET retries = retries + 1 WHERE id = ? RETURNING retries",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(retries)
}
