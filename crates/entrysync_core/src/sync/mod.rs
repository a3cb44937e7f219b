//! Outbox push and server pull.
//!
//! The [`Synchronizer`] connects an [`EntrySyncEngine`] to the server of
//! record through two transport traits:
//!
//! - [`MutationTransport`] sends pending outbox mutations and returns one
//!   [`MutationResult`] per mutation. Accepted mutations leave the outbox.
//!   Rejected ones are reverted locally. Transient failures are retried on
//!   the next push until `max_mutation_retries` is reached.
//! - [`TransactionSource`] returns committed transactions (and interactions)
//!   with a version above a cursor. The cursor for a root only advances past
//!   a transaction once it has been applied, so a failed application is
//!   retried on the next pull.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capabilities::BoxFuture;
use crate::engine::EntrySyncEngine;
use crate::error::Result;
use crate::store::cursors::{self, CursorScope};
use crate::store::mutations;
use crate::types::{ActorContext, EntryInteraction, EntryTransaction, Mutation};

/// Server verdict on one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Committed (or already committed earlier)
    Ok,
    /// The actor may not perform the change
    Unauthorized,
    /// The target entry does not exist on the server
    NotFound,
    /// The change conflicts with committed state
    Conflict,
    /// The payload is malformed
    BadRequest,
    /// The server failed; the mutation may succeed later
    InternalError,
}

impl MutationStatus {
    /// Whether the server will never accept this mutation.
    pub fn is_permanent_rejection(&self) -> bool {
        matches!(
            self,
            MutationStatus::Unauthorized
                | MutationStatus::NotFound
                | MutationStatus::Conflict
                | MutationStatus::BadRequest
        )
    }
}

/// Per-mutation result returned by a [`MutationTransport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    /// Id of the mutation this result is about
    pub id: String,
    /// Verdict
    pub status: MutationStatus,
    /// Optional detail for logs
    #[serde(default)]
    pub message: Option<String>,
}

impl MutationResult {
    /// A result without detail message.
    pub fn new(id: impl Into<String>, status: MutationStatus) -> Self {
        Self {
            id: id.into(),
            status,
            message: None,
        }
    }
}

/// Sends outbox mutations to the server.
pub trait MutationTransport: Send + Sync {
    /// Submit `mutations` on behalf of `actor`.
    ///
    /// An `Err` means nothing is known about the batch; the outbox is left
    /// untouched and no retry is counted.
    fn send_mutations<'a>(
        &'a self,
        actor: &'a ActorContext,
        mutations: &'a [Mutation],
    ) -> BoxFuture<'a, Result<Vec<MutationResult>>>;
}

/// Reads committed state from the server.
pub trait TransactionSource: Send + Sync {
    /// Transactions of `root_id` with `version > after_version`, ascending,
    /// at most `limit`.
    fn fetch_transactions<'a>(
        &'a self,
        root_id: &'a str,
        after_version: i64,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<EntryTransaction>>>;

    /// Interactions of `root_id` with `version > after_version`, ascending,
    /// at most `limit`.
    fn fetch_interactions<'a>(
        &'a self,
        root_id: &'a str,
        after_version: i64,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<EntryInteraction>>>;
}

/// Outcome of one [`Synchronizer::push_mutations`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Mutations the server committed
    pub acknowledged: usize,
    /// Mutations rejected and reverted locally
    pub reverted: usize,
    /// Mutations kept for another attempt
    pub retried: usize,
}

impl PushReport {
    /// Number of mutations that were sent.
    pub fn total(&self) -> usize {
        self.acknowledged + self.reverted + self.retried
    }
}

/// Outcome of one pull call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Items applied (including no-op re-applications)
    pub applied: usize,
    /// Items that changed local state
    pub changed: usize,
    /// Cursor after the pull
    pub cursor: i64,
    /// Whether the pull stopped at an item that failed to apply
    pub interrupted: bool,
}

/// Drives the outbox and the pull cursors of one replica.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    engine: Arc<EntrySyncEngine>,
}

impl Synchronizer {
    /// Create a synchronizer for `engine`.
    pub fn new(engine: Arc<EntrySyncEngine>) -> Self {
        Self { engine }
    }

    /// The engine being synchronized.
    pub fn engine(&self) -> &Arc<EntrySyncEngine> {
        &self.engine
    }

    /// Send one batch of pending mutations and settle each result.
    pub async fn push_mutations(&self, transport: &dyn MutationTransport) -> Result<PushReport> {
        let config = self.engine.config();
        let store = self.engine.store();
        let batch = store.read(|conn| mutations::list_pending(conn, config.mutation_batch_size))?;

        let mut report = PushReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        let results = transport.send_mutations(self.engine.actor(), &batch).await?;
        let statuses: HashMap<&str, MutationStatus> = results
            .iter()
            .map(|result| (result.id.as_str(), result.status))
            .collect();

        for mutation in &batch {
            match statuses.get(mutation.id.as_str()) {
                Some(MutationStatus::Ok) => {
                    store.read(|conn| mutations::delete(conn, &mutation.id))?;
                    report.acknowledged += 1;
                }
                Some(status) if status.is_permanent_rejection() => {
                    log::warn!(
                        "Mutation {} ({}) rejected with {:?}, reverting",
                        mutation.id,
                        mutation.mutation_type,
                        status
                    );
                    self.reject(mutation).await?;
                    report.reverted += 1;
                }
                status => {
                    let retries =
                        store.read(|conn| mutations::increment_retries(conn, &mutation.id))?;
                    let retries = retries.unwrap_or(mutation.retries + 1);
                    if retries >= config.max_mutation_retries {
                        log::warn!(
                            "Mutation {} failed {} times ({:?}), giving up",
                            mutation.id,
                            retries,
                            status
                        );
                        self.reject(mutation).await?;
                        report.reverted += 1;
                    } else {
                        log::debug!("Mutation {} will be retried ({:?})", mutation.id, status);
                        report.retried += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Revert what a rejected mutation did locally and drop it.
    async fn reject(&self, mutation: &Mutation) -> Result<()> {
        if mutation.mutation_type.carries_transaction() {
            match mutation.transaction() {
                Ok(transaction) => {
                    if let Err(e) = self.engine.revert_transaction(&transaction).await {
                        log::error!(
                            "Failed to revert {} transaction {}: {}",
                            transaction.operation,
                            transaction.id,
                            e
                        );
                    }
                }
                Err(e) => log::error!("Unreadable mutation {}: {}", mutation.id, e),
            }
        }
        self.engine
            .store()
            .read(|conn| mutations::delete(conn, &mutation.id))?;
        Ok(())
    }

    /// Pull and apply committed transactions of `root_id`.
    pub async fn pull_transactions(
        &self,
        source: &dyn TransactionSource,
        root_id: &str,
    ) -> Result<PullReport> {
        let limit = self.engine.config().pull_batch_size.max(1);
        let store = self.engine.store();
        let mut report = PullReport {
            cursor: store.read(|conn| cursors::get(conn, root_id, CursorScope::Transactions))?,
            ..PullReport::default()
        };

        loop {
            let before = report.cursor;
            let batch = source.fetch_transactions(root_id, report.cursor, limit).await?;
            let full = batch.len() >= limit;

            for transaction in &batch {
                match self.engine.apply_server_transaction(transaction).await {
                    Ok(changed) => {
                        report.applied += 1;
                        report.changed += usize::from(changed);
                        report.cursor = report.cursor.max(transaction.version);
                        store.read(|conn| {
                            cursors::advance(
                                conn,
                                root_id,
                                CursorScope::Transactions,
                                report.cursor,
                            )
                        })?;
                    }
                    Err(e) => {
                        log::warn!(
                            "Failed to apply server transaction {} (version {}): {}",
                            transaction.id,
                            transaction.version,
                            e
                        );
                        report.interrupted = true;
                        return Ok(report);
                    }
                }
            }

            if !full || report.cursor == before {
                return Ok(report);
            }
        }
    }

    /// Pull and store interactions of `root_id`.
    pub async fn pull_interactions(
        &self,
        source: &dyn TransactionSource,
        root_id: &str,
    ) -> Result<PullReport> {
        let limit = self.engine.config().pull_batch_size.max(1);
        let store = self.engine.store();
        let mut report = PullReport {
            cursor: store.read(|conn| cursors::get(conn, root_id, CursorScope::Interactions))?,
            ..PullReport::default()
        };

        loop {
            let before = report.cursor;
            let batch = source.fetch_interactions(root_id, report.cursor, limit).await?;
            let full = batch.len() >= limit;

            for interaction in &batch {
                match self.engine.sync_server_entry_interaction(interaction).await {
                    Ok(changed) => {
                        report.applied += 1;
                        report.changed += usize::from(changed);
                        report.cursor = report.cursor.max(interaction.version);
                        store.read(|conn| {
                            cursors::advance(
                                conn,
                                root_id,
                                CursorScope::Interactions,
                                report.cursor,
                            )
                        })?;
                    }
                    Err(e) => {
                        log::warn!(
                            "Failed to store interaction of {} on {}: {}",
                            interaction.collaborator_id,
                            interaction.entry_id,
                            e
                        );
                        report.interrupted = true;
                        return Ok(report);
                    }
                }
            }

            if !full || report.cursor == before {
                return Ok(report);
            }
        }
    }
}
