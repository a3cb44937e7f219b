use rusqlite::Connection;

/// SQL schema for the committed log
const SCHEMA: &str = r#"
-- Committed transactions, append-only
CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    entry_id TEXT NOT NULL,
    root_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    data BLOB,
    created_at INTEGER NOT NULL,
    created_by TEXT NOT NULL,
    version INTEGER NOT NULL UNIQUE,
    server_created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_entry ON transactions(entry_id);
CREATE INDEX IF NOT EXISTS idx_transactions_root_version ON transactions(root_id, version);

-- Named monotonic counters
CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

INSERT OR IGNORE INTO counters (name, value) VALUES ('workspace_version', 0);

-- Seen/opened state per collaborator
CREATE TABLE IF NOT EXISTS interactions (
    entry_id TEXT NOT NULL,
    collaborator_id TEXT NOT NULL,
    root_id TEXT NOT NULL,
    first_seen_at INTEGER,
    last_seen_at INTEGER,
    first_opened_at INTEGER,
    last_opened_at INTEGER,
    version INTEGER NOT NULL,
    PRIMARY KEY (entry_id, collaborator_id)
);

CREATE INDEX IF NOT EXISTS idx_interactions_root_version ON interactions(root_id, version);
"#;

/// Initialize the database with the log schema
pub fn init_database(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
