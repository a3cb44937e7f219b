use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use entrysync_core::sync::MutationStatus;
use entrysync_core::types::{
    ActorContext, EntryInteraction, EntryTransaction, InteractionMark, MutationType, Operation,
    now,
};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::schema::init_database;
use crate::error::ServerError;
use crate::policy::CommitPolicy;

/// Outcome of submitting one transaction to the log.
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    /// Appended with a fresh version
    Committed(EntryTransaction),
    /// Already in the log; the stored copy is returned unchanged
    Duplicate(EntryTransaction),
    /// Refused, with a status the client can act on
    Rejected {
        status: MutationStatus,
        reason: String,
    },
}

impl Commit {
    /// Status reported back to the submitting client.
    pub fn status(&self) -> MutationStatus {
        match self {
            Commit::Committed(_) | Commit::Duplicate(_) => MutationStatus::Ok,
            Commit::Rejected { status, .. } => *status,
        }
    }

    fn reject(status: MutationStatus, reason: impl Into<String>) -> Self {
        Commit::Rejected {
            status,
            reason: reason.into(),
        }
    }
}

/// What the log knows about one entry.
struct EntryHistory {
    root_id: String,
    deleted: bool,
}

/// Committed transaction log and interaction table.
#[derive(Clone)]
pub struct LogRepo {
    conn: Arc<Mutex<Connection>>,
}

impl LogRepo {
    /// Wrap a connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self, ServerError> {
        init_database(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open (or create) the log database at `path`.
    pub fn open(path: &Path) -> Result<Self, ServerError> {
        let conn = Connection::open(path)?;
        Self::new(conn)
    }

    /// Log database that lives in memory.
    pub fn in_memory() -> Result<Self, ServerError> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ServerError> {
        self.conn.lock().map_err(|_| ServerError::LockPoisoned)
    }

    /// Validate and append a transaction.
    ///
    /// Validation, the policy check, the version bump and the insert run in
    /// one SQL transaction, so versions are gapless and strictly increasing.
    pub fn commit(
        &self,
        actor: &ActorContext,
        transaction: &EntryTransaction,
        policy: &dyn CommitPolicy,
    ) -> Result<Commit, ServerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if let Some(existing) = get_transaction(&tx, &transaction.id)? {
            return Ok(Commit::Duplicate(existing));
        }
        if let Some(rejection) = validate(&tx, transaction)? {
            return Ok(rejection);
        }
        if !policy.allows(actor, transaction) {
            return Ok(Commit::reject(
                MutationStatus::Unauthorized,
                format!(
                    "{} may not {} entry {}",
                    actor.user_id, transaction.operation, transaction.entry_id
                ),
            ));
        }

        let committed = EntryTransaction {
            version: next_version(&tx)?,
            server_created_at: Some(now()),
            ..transaction.clone()
        };
        tx.execute(
            "INSERT INTO transactions
                (id, entry_id, root_id, operation, data, created_at, created_by, version, server_created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                committed.id,
                committed.entry_id,
                committed.root_id,
                committed.operation.to_string(),
                committed.data,
                committed.created_at.timestamp_millis(),
                committed.created_by,
                committed.version,
                committed.server_created_at.map(|at| at.timestamp_millis()),
            ],
        )?;
        if committed.operation == Operation::Delete {
            tx.execute(
                "DELETE FROM interactions WHERE entry_id = ?",
                [&committed.entry_id],
            )?;
        }
        tx.commit()?;

        Ok(Commit::Committed(committed))
    }

    /// One committed transaction.
    pub fn get_transaction(&self, id: &str) -> Result<Option<EntryTransaction>, ServerError> {
        let conn = self.lock()?;
        get_transaction(&conn, id)
    }

    /// Transactions of `root_id` with a version above `after_version`,
    /// ascending.
    pub fn pull_transactions(
        &self,
        root_id: &str,
        after_version: i64,
        limit: usize,
    ) -> Result<Vec<EntryTransaction>, ServerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, entry_id, root_id, operation, data, created_at, created_by, version, server_created_at
             FROM transactions
             WHERE root_id = ? AND version > ?
             ORDER BY version
             LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![root_id, after_version, limit as i64], read_transaction)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Merge a seen/opened mark into the stored interaction and give it a
    /// new version.
    ///
    /// Returns `None` when the entry was never created or has been deleted.
    pub fn record_interaction(
        &self,
        kind: MutationType,
        mark: &InteractionMark,
    ) -> Result<Option<EntryInteraction>, ServerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let history = match entry_history(&tx, &mark.entry_id)? {
            Some(history) if !history.deleted => history,
            _ => return Ok(None),
        };

        let mut interaction = get_interaction(&tx, &mark.entry_id, &mark.collaborator_id)?
            .unwrap_or_else(|| {
                EntryInteraction::empty(&mark.entry_id, &mark.collaborator_id, &history.root_id)
            });
        match kind {
            MutationType::MarkEntryOpened => interaction.mark_opened(mark.at),
            _ => interaction.mark_seen(mark.at),
        }
        interaction.version = next_version(&tx)?;

        tx.execute(
            "INSERT INTO interactions
                (entry_id, collaborator_id, root_id, first_seen_at, last_seen_at, first_opened_at, last_opened_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(entry_id, collaborator_id) DO UPDATE SET
                first_seen_at = excluded.first_seen_at,
                last_seen_at = excluded.last_seen_at,
                first_opened_at = excluded.first_opened_at,
                last_opened_at = excluded.last_opened_at,
                version = excluded.version",
            params![
                interaction.entry_id,
                interaction.collaborator_id,
                interaction.root_id,
                interaction.first_seen_at.map(|at| at.timestamp_millis()),
                interaction.last_seen_at.map(|at| at.timestamp_millis()),
                interaction.first_opened_at.map(|at| at.timestamp_millis()),
                interaction.last_opened_at.map(|at| at.timestamp_millis()),
                interaction.version,
            ],
        )?;
        tx.commit()?;

        Ok(Some(interaction))
    }

    /// Interactions of `root_id` with a version above `after_version`,
    /// ascending.
    pub fn pull_interactions(
        &self,
        root_id: &str,
        after_version: i64,
        limit: usize,
    ) -> Result<Vec<EntryInteraction>, ServerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT entry_id, collaborator_id, root_id, first_seen_at, last_seen_at, first_opened_at, last_opened_at, version
             FROM interactions
             WHERE root_id = ? AND version > ?
             ORDER BY version
             LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![root_id, after_version, limit as i64], read_interaction)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Latest version handed out.
    pub fn current_version(&self) -> Result<i64, ServerError> {
        let conn = self.lock()?;
        let version = conn.query_row(
            "SELECT value FROM counters WHERE name = 'workspace_version'",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }
}

/// Structural checks against the committed history of the entry.
fn validate(
    conn: &Connection,
    transaction: &EntryTransaction,
) -> Result<Option<Commit>, ServerError> {
    if transaction.operation != Operation::Delete && transaction.data.is_none() {
        return Ok(Some(Commit::reject(
            MutationStatus::BadRequest,
            format!("{} transaction without update data", transaction.operation),
        )));
    }

    let history = entry_history(conn, &transaction.entry_id)?;
    let rejection = match (transaction.operation, history) {
        (Operation::Create, Some(_)) => Some(Commit::reject(
            MutationStatus::Conflict,
            format!("entry {} already exists", transaction.entry_id),
        )),
        (Operation::Create, None) => None,
        (_, None) => Some(Commit::reject(
            MutationStatus::NotFound,
            format!("entry {} was never created", transaction.entry_id),
        )),
        (_, Some(history)) if history.deleted => Some(Commit::reject(
            MutationStatus::NotFound,
            format!("entry {} is deleted", transaction.entry_id),
        )),
        (_, Some(history)) if history.root_id != transaction.root_id => Some(Commit::reject(
            MutationStatus::BadRequest,
            format!(
                "entry {} belongs to root {}, not {}",
                transaction.entry_id, history.root_id, transaction.root_id
            ),
        )),
        _ => None,
    };
    Ok(rejection)
}

fn entry_history(conn: &Connection, entry_id: &str) -> Result<Option<EntryHistory>, ServerError> {
    let root_id: Option<String> = conn
        .query_row(
            "SELECT root_id FROM transactions WHERE entry_id = ? AND operation = 'create'",
            [entry_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(root_id) = root_id else {
        return Ok(None);
    };

    let deleted: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM transactions WHERE entry_id = ? AND operation = 'delete')",
        [entry_id],
        |row| row.get(0),
    )?;
    Ok(Some(EntryHistory { root_id, deleted }))
}

fn next_version(conn: &Connection) -> Result<i64, ServerError> {
    let version = conn.query_row(
        "UPDATE counters SET value = value + 1 WHERE name = 'workspace_version' RETURNING value",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn get_transaction(conn: &Connection, id: &str) -> Result<Option<EntryTransaction>, ServerError> {
    let transaction = conn
        .query_row(
            "SELECT id, entry_id, root_id, operation, data, created_at, created_by, version, server_created_at
             FROM transactions WHERE id = ?",
            [id],
            read_transaction,
        )
        .optional()?;
    Ok(transaction)
}

fn get_interaction(
    conn: &Connection,
    entry_id: &str,
    collaborator_id: &str,
) -> Result<Option<EntryInteraction>, ServerError> {
    let interaction = conn
        .query_row(
            "SELECT entry_id, collaborator_id, root_id, first_seen_at, last_seen_at, first_opened_at, last_opened_at, version
             FROM interactions WHERE entry_id = ? AND collaborator_id = ?",
            [entry_id, collaborator_id],
            read_interaction,
        )
        .optional()?;
    Ok(interaction)
}

fn millis(idx: usize, value: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn optional_millis(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|value| millis(idx, value))
        .transpose()
}

fn read_transaction(row: &Row) -> rusqlite::Result<EntryTransaction> {
    let operation: String = row.get(3)?;
    let operation = operation
        .parse::<Operation>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?;
    Ok(EntryTransaction {
        id: row.get(0)?,
        entry_id: row.get(1)?,
        root_id: row.get(2)?,
        operation,
        data: row.get(4)?,
        created_at: millis(5, row.get(5)?)?,
        created_by: row.get(6)?,
        version: row.get(7)?,
        server_created_at: optional_millis(row, 8)?,
    })
}

fn read_interaction(row: &Row) -> rusqlite::Result<EntryInteraction> {
    Ok(EntryInteraction {
        entry_id: row.get(0)?,
        collaborator_id: row.get(1)?,
        root_id: row.get(2)?,
        first_seen_at: optional_millis(row, 3)?,
        last_seen_at: optional_millis(row, 4)?,
        first_opened_at: optional_millis(row, 5)?,
        last_opened_at: optional_millis(row, 6)?,
        version: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AllowAllCommits;
    use entrysync_core::types::generate_id;

    fn actor() -> ActorContext {
        ActorContext::new("acct", "ws", "alice")
    }

    fn transaction(entry_id: &str, operation: Operation) -> EntryTransaction {
        EntryTransaction {
            id: generate_id(),
            entry_id: entry_id.to_string(),
            root_id: "root".to_string(),
            operation,
            data: (operation != Operation::Delete).then(|| vec![0, 0]),
            created_at: now(),
            created_by: "alice".to_string(),
            version: 0,
            server_created_at: None,
        }
    }

    fn commit(repo: &LogRepo, transaction: &EntryTransaction) -> Commit {
        repo.commit(&actor(), transaction, &AllowAllCommits).unwrap()
    }

    #[test]
    fn test_commit_assigns_increasing_versions() {
        let repo = LogRepo::in_memory().unwrap();
        let create = transaction("e1", Operation::Create);
        let update = transaction("e1", Operation::Update);

        let Commit::Committed(first) = commit(&repo, &create) else {
            panic!("create not committed");
        };
        let Commit::Committed(second) = commit(&repo, &update) else {
            panic!("update not committed");
        };
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert!(second.server_created_at.is_some());
        assert_eq!(repo.current_version().unwrap(), 2);
    }

    #[test]
    fn test_duplicate_commit_is_idempotent() {
        let repo = LogRepo::in_memory().unwrap();
        let create = transaction("e1", Operation::Create);

        let Commit::Committed(stored) = commit(&repo, &create) else {
            panic!("create not committed");
        };
        assert_eq!(commit(&repo, &create), Commit::Duplicate(stored));
        assert_eq!(repo.current_version().unwrap(), 1);
    }

    #[test]
    fn test_commit_rejections() {
        let repo = LogRepo::in_memory().unwrap();

        let orphan = transaction("e1", Operation::Update);
        assert_eq!(commit(&repo, &orphan).status(), MutationStatus::NotFound);

        let mut empty = transaction("e1", Operation::Create);
        empty.data = None;
        assert_eq!(commit(&repo, &empty).status(), MutationStatus::BadRequest);

        commit(&repo, &transaction("e1", Operation::Create));
        assert_eq!(
            commit(&repo, &transaction("e1", Operation::Create)).status(),
            MutationStatus::Conflict
        );

        let mut moved = transaction("e1", Operation::Update);
        moved.root_id = "elsewhere".to_string();
        assert_eq!(commit(&repo, &moved).status(), MutationStatus::BadRequest);

        commit(&repo, &transaction("e1", Operation::Delete));
        assert_eq!(
            commit(&repo, &transaction("e1", Operation::Update)).status(),
            MutationStatus::NotFound
        );
        // Rejections do not consume versions
        assert_eq!(repo.current_version().unwrap(), 2);
    }

    #[test]
    fn test_policy_refusal() {
        let repo = LogRepo::in_memory().unwrap();
        let deny = |_: &ActorContext, _: &EntryTransaction| false;
        let outcome = repo
            .commit(&actor(), &transaction("e1", Operation::Create), &deny)
            .unwrap();
        assert_eq!(outcome.status(), MutationStatus::Unauthorized);
        assert!(repo.pull_transactions("root", 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_pull_transactions_after_cursor() {
        let repo = LogRepo::in_memory().unwrap();
        commit(&repo, &transaction("e1", Operation::Create));
        commit(&repo, &transaction("e2", Operation::Create));
        commit(&repo, &transaction("e1", Operation::Update));

        let all = repo.pull_transactions("root", 0, 10).unwrap();
        assert_eq!(
            all.iter().map(|t| t.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let page = repo.pull_transactions("root", 1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].entry_id, "e2");
        assert!(repo.pull_transactions("other", 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_record_interaction() {
        let repo = LogRepo::in_memory().unwrap();
        let mark = InteractionMark {
            entry_id: "e1".to_string(),
            root_id: "root".to_string(),
            collaborator_id: "bob".to_string(),
            at: now(),
        };
        assert!(
            repo.record_interaction(MutationType::MarkEntrySeen, &mark)
                .unwrap()
                .is_none()
        );

        commit(&repo, &transaction("e1", Operation::Create));
        let seen = repo
            .record_interaction(MutationType::MarkEntrySeen, &mark)
            .unwrap()
            .unwrap();
        assert_eq!(seen.version, 2);
        assert!(seen.first_opened_at.is_none());

        let opened = repo
            .record_interaction(MutationType::MarkEntryOpened, &mark)
            .unwrap()
            .unwrap();
        assert_eq!(opened.version, 3);
        assert_eq!(opened.first_seen_at, seen.first_seen_at);
        assert!(opened.last_opened_at.is_some());

        assert_eq!(repo.pull_interactions("root", 2, 10).unwrap(), vec![opened]);

        commit(&repo, &transaction("e1", Operation::Delete));
        assert!(repo.pull_interactions("root", 0, 10).unwrap().is_empty());
    }
}
