//! Text side index used by search.
//!
//! The index row of an entry is always replaced as a whole (delete, then
//! insert if the extractor produced anything).

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::types::EntryText;

/// Replace the index row for `id` with `text`, or remove it when `None`.
pub fn replace(conn: &Connection, id: &str, text: Option<&EntryText>) -> Result<()> {
    delete(conn, id)?;
    if let Some(text) = text {
        conn.execute(
            "INSERT INTO entry_texts (id, name, text) VALUES (?, ?, ?)",
            params![id, text.name, text.text],
        )?;
    }
    Ok(())
}

/// Remove the index row for `id`.
pub fn delete(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM entry_texts WHERE id = ?", params![id])?;
    Ok(())
}

/// Fetch the index row for `id`.
pub fn get(conn: &Connection, id: &str) -> Result<Option<EntryText>> {
    let text = conn
        .query_row(
            "SELECT id, name, text FROM entry_texts WHERE id = ?",
            params![id],
            |row| {
                Ok(EntryText {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    text: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(text)
}

/// Case-insensitive substring search over names and texts.
pub fn search(conn: &Connection, query: &str) -> Result<Vec<EntryText>> {
    let pattern = format!("%{}%", escape_like(query));
    let mut stmt = conn.prepare(
        "SELECT id, name, text FROM entry_texts
         WHERE name LIKE ?1 ESCAPE '\\' OR text LIKE ?1 ESCAPE '\\'
         ORDER BY id ASC",
    )?;
    let results = stmt
        .query_map(params![pattern], |row| {
            Ok(EntryText {
                id: row.get(0)?,
                name: row.get(1)?,
                text: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(results)
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WorkspaceStore;

    fn text(id: &str, name: &str, body: Option<&str>) -> EntryText {
        EntryText {
            id: id.to_string(),
            name: Some(name.to_string()),
            text: body.map(String::from),
        }
    }

    #[test]
    fn test_replace_and_search() {
        let store = WorkspaceStore::in_memory().unwrap();
        store
            .read(|conn| {
                replace(conn, "e1", Some(&text("e1", "Roadmap", Some("ship the sync engine"))))?;
                replace(conn, "e2", Some(&text("e2", "Notes", None)))?;

                let hits: Vec<_> = search(conn, "SYNC")?.into_iter().map(|t| t.id).collect();
                assert_eq!(hits, vec!["e1"]);

                replace(conn, "e1", Some(&text("e1", "Roadmap", None)))?;
                assert!(search(conn, "sync")?.is_empty());

                replace(conn, "e2", None)?;
                assert!(get(conn, "e2")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_wildcards_are_literal() {
        let store = WorkspaceStore::in_memory().unwrap();
        store
            .read(|conn| {
                replace(conn, "e1", Some(&text("e1", "100% done", None)))?;
                replace(conn, "e2", Some(&text("e2", "1000 done", None)))?;
                let hits: Vec<_> = search(conn, "0%")?.into_iter().map(|t| t.id).collect();
                assert_eq!(hits, vec!["e1"]);
                Ok(())
            })
            .unwrap();
    }
}
