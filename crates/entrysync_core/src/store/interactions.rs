//! Seen/opened state keyed by `(entry_id, collaborator_id)`.

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::Result;
use crate::types::{EntryInteraction, from_millis, to_millis};

const COLUMNS: &str = "entry_id, collaborator_id, root_id, first_seen_at, last_seen_at, \
                       first_opened_at, last_opened_at, version";

fn from_row(row: &Row<'_>) -> rusqlite::Result<EntryInteraction> {
    let at = |idx: usize| -> rusqlite::Result<_> {
        Ok(row.get::<_, Option<i64>>(idx)?.map(from_millis))
    };

    Ok(EntryInteraction {
        entry_id: row.get(0)?,
        collaborator_id: row.get(1)?,
        root_id: row.get(2)?,
        first_seen_at: at(3)?,
        last_seen_at: at(4)?,
        first_opened_at: at(5)?,
        last_opened_at: at(6)?,
        version: row.get(7)?,
    })
}

fn write(
    conn: &Connection,
    interaction: &EntryInteraction,
    only_new_version: bool,
) -> Result<bool> {
    let guard = if only_new_version {
        "WHERE entry_interactions.version <> excluded.version"
    } else {
        ""
    };
    let rows = conn.execute(
        &format!(
            "INSERT INTO entry_interactions ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(entry_id, collaborator_id) DO UPDATE SET
                 root_id = excluded.root_id,
                 first_seen_at = excluded.first_seen_at,
                 last_seen_at = excluded.last_seen_at,
                 first_opened_at = excluded.first_opened_at,
                 last_opened_at = excluded.last_opened_at,
                 version = excluded.version
             {guard}"
        ),
        params![
            interaction.entry_id,
            interaction.collaborator_id,
            interaction.root_id,
            interaction.first_seen_at.as_ref().map(to_millis),
            interaction.last_seen_at.as_ref().map(to_millis),
            interaction.first_opened_at.as_ref().map(to_millis),
            interaction.last_opened_at.as_ref().map(to_millis),
            interaction.version,
        ],
    )?;
    Ok(rows == 1)
}

/// Insert or replace an interaction unconditionally.
pub fn upsert(conn: &Connection, interaction: &EntryInteraction) -> Result<()> {
    write(conn, interaction, false)?;
    Ok(())
}

/// Insert an interaction, or replace the stored one when its version differs.
///
/// Returns whether a row was written.
pub fn upsert_if_version_differs(
    conn: &Connection,
    interaction: &EntryInteraction,
) -> Result<bool> {
    write(conn, interaction, true)
}

/// Fetch the interaction of one collaborator with an entry.
pub fn get(
    conn: &Connection,
    entry_id: &str,
    collaborator_id: &str,
) -> Result<Option<EntryInteraction>> {
    let interaction = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM entry_interactions WHERE entry_id = ? AND collaborator_id = ?"
            ),
            params![entry_id, collaborator_id],
            from_row,
        )
        .optional()?;
    Ok(interaction)
}

/// All interactions recorded for an entry, ordered by collaborator.
pub fn list_for_entry(conn: &Connection, entry_id: &str) -> Result<Vec<EntryInteraction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM entry_interactions WHERE entry_id = ? ORDER BY collaborator_id ASC"
    ))?;
    let interactions = stmt
        .query_map(params![entry_id], from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(interactions)
}

/// Remove every interaction of an entry.
pub fn delete_for_entry(conn: &Connection, entry_id: &str) -> Result<usize> {
    let rows = conn.execute(
        "DELETE FROM entry_interactions WHERE entry_id = ?",
        params![entry_id],
    )?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorkspaceStore;
    use crate::types::now;

    #[test]
    fn test_version_guarded_upsert() {
        let store = WorkspaceStore::in_memory().unwrap();
        let mut interaction = EntryInteraction::empty("e1", "u1", "r1");
        interaction.mark_opened(now());
        interaction.version = 3;

        store
            .read(|conn| {
                assert!(upsert_if_version_differs(conn, &interaction)?);
                // Same version: no write
                assert!(!upsert_if_version_differs(conn, &interaction)?);

                let mut newer = interaction.clone();
                newer.version = 4;
                assert!(upsert_if_version_differs(conn, &newer)?);
                assert_eq!(get(conn, "e1", "u1")?, Some(newer));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_list_and_delete() {
        let store = WorkspaceStore::in_memory().unwrap();
        store
            .read(|conn| {
                upsert(conn, &EntryInteraction::empty("e1", "u2", "r1"))?;
                upsert(conn, &EntryInteraction::empty("e1", "u1", "r1"))?;
                upsert(conn, &EntryInteraction::empty("e2", "u1", "r1"))?;

                let collaborators: Vec<_> = list_for_entry(conn, "e1")?
                    .into_iter()
                    .map(|i| i.collaborator_id)
                    .collect();
                assert_eq!(collaborators, vec!["u1", "u2"]);

                assert_eq!(delete_for_entry(conn, "e1")?, 2);
                assert!(get(conn, "e1", "u1")?.is_none());
                assert!(get(conn, "e2", "u1")?.is_some());
                Ok(())
            })
            .unwrap();
    }
}
