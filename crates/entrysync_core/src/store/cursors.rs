//! Per-root pull cursors.
//!
//! A cursor is the highest server version the replica has applied for a
//! root. Transactions and interactions are versioned from the same server
//! counter but pulled separately, so each has its own cursor.

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;

/// Which server stream a cursor tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorScope {
    /// Committed entry transactions
    Transactions,
    /// Entry interactions
    Interactions,
}

impl CursorScope {
    fn as_str(&self) -> &'static str {
        match self {
            CursorScope::Transactions => "transactions",
            CursorScope::Interactions => "interactions",
        }
    }
}

/// Current cursor, 0 when nothing was pulled yet.
pub fn get(conn: &Connection, root_id: &str, scope: CursorScope) -> Result<i64> {
    let version = conn
        .query_row(
            "SELECT version FROM sync_cursors WHERE root_id = ? AND scope = ?",
            params![root_id, scope.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

/// Move the cursor forward to `version`. Never moves it backwards.
pub fn advance(conn: &Connection, root_id: &str, scope: CursorScope, version: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_cursors (root_id, scope, version) VALUES (?, ?, ?)
         ON CONFLICT(root_id, scope) DO UPDATE SET version = MAX(version, excluded.version)",
        params![root_id, scope.as_str(), version],
    )?;
    Ok(())
}
