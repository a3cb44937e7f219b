//! The server of record as seen by replicas.

use std::sync::Arc;

use entrysync_core::capabilities::BoxFuture;
use entrysync_core::sync::{MutationResult, MutationStatus, MutationTransport, TransactionSource};
use entrysync_core::types::{
    ActorContext, EntryInteraction, EntryTransaction, Mutation, MutationType,
};

use crate::config::Config;
use crate::db::{Commit, LogRepo};
use crate::error::ServerError;
use crate::policy::{AllowAllCommits, CommitPolicy};

/// Accepts outbox mutations and serves committed state.
#[derive(Clone)]
pub struct SyncServer {
    repo: LogRepo,
    policy: Arc<dyn CommitPolicy>,
    config: Config,
}

impl SyncServer {
    /// Server over `repo` that allows every well-formed commit.
    pub fn new(repo: LogRepo, config: Config) -> Self {
        Self {
            repo,
            policy: Arc::new(AllowAllCommits),
            config,
        }
    }

    /// Open the log database named by `config`.
    pub fn open(config: Config) -> Result<Self, ServerError> {
        let repo = LogRepo::open(&config.database_path)?;
        tracing::info!("Opened log database at {:?}", config.database_path);
        Ok(Self::new(repo, config))
    }

    /// Replace the commit policy.
    pub fn with_policy(mut self, policy: impl CommitPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn repo(&self) -> &LogRepo {
        &self.repo
    }

    /// Settle a batch of mutations, one result per mutation, in order.
    ///
    /// A failure on one mutation is reported as `InternalError` for that
    /// mutation only.
    pub fn apply_mutations(
        &self,
        actor: &ActorContext,
        mutations: &[Mutation],
    ) -> Vec<MutationResult> {
        mutations
            .iter()
            .map(|mutation| {
                self.apply_mutation(actor, mutation).unwrap_or_else(|e| {
                    tracing::error!("Mutation {} failed: {}", mutation.id, e);
                    MutationResult {
                        message: Some(e.to_string()),
                        ..MutationResult::new(&mutation.id, MutationStatus::InternalError)
                    }
                })
            })
            .collect()
    }

    fn apply_mutation(
        &self,
        actor: &ActorContext,
        mutation: &Mutation,
    ) -> Result<MutationResult, ServerError> {
        if mutation.mutation_type.carries_transaction() {
            self.apply_transaction(actor, mutation)
        } else {
            self.apply_interaction(actor, mutation)
        }
    }

    fn apply_transaction(
        &self,
        actor: &ActorContext,
        mutation: &Mutation,
    ) -> Result<MutationResult, ServerError> {
        let transaction = match mutation.transaction() {
            Ok(transaction) => transaction,
            Err(e) => return Ok(bad_request(mutation, e.to_string())),
        };
        if MutationType::for_operation(transaction.operation) != mutation.mutation_type {
            return Ok(bad_request(
                mutation,
                format!(
                    "{} mutation carries a {} transaction",
                    mutation.mutation_type, transaction.operation
                ),
            ));
        }

        let commit = self.repo.commit(actor, &transaction, self.policy.as_ref())?;
        let status = commit.status();
        let message = match commit {
            Commit::Committed(committed) => {
                tracing::info!(
                    "Committed {} {} of entry {} at version {}",
                    committed.operation,
                    committed.id,
                    committed.entry_id,
                    committed.version
                );
                None
            }
            Commit::Duplicate(existing) => {
                tracing::debug!("Transaction {} already committed", existing.id);
                None
            }
            Commit::Rejected { status, reason } => {
                tracing::warn!(
                    "Rejected transaction {} from {}: {:?} ({})",
                    transaction.id,
                    actor.user_id,
                    status,
                    reason
                );
                Some(reason)
            }
        };

        Ok(MutationResult {
            message,
            ..MutationResult::new(&mutation.id, status)
        })
    }

    fn apply_interaction(
        &self,
        actor: &ActorContext,
        mutation: &Mutation,
    ) -> Result<MutationResult, ServerError> {
        let mark = match mutation.interaction() {
            Ok(mark) => mark,
            Err(e) => return Ok(bad_request(mutation, e.to_string())),
        };
        if mark.collaborator_id != actor.user_id {
            tracing::warn!(
                "{} tried to record an interaction for {}",
                actor.user_id,
                mark.collaborator_id
            );
            return Ok(MutationResult::new(&mutation.id, MutationStatus::Unauthorized));
        }

        let status = match self.repo.record_interaction(mutation.mutation_type, &mark)? {
            Some(interaction) => {
                tracing::debug!(
                    "Recorded {} of {} by {} at version {}",
                    mutation.mutation_type,
                    interaction.entry_id,
                    interaction.collaborator_id,
                    interaction.version
                );
                MutationStatus::Ok
            }
            None => MutationStatus::NotFound,
        };
        Ok(MutationResult::new(&mutation.id, status))
    }
}

fn bad_request(mutation: &Mutation, message: String) -> MutationResult {
    tracing::warn!("Malformed mutation {}: {}", mutation.id, message);
    MutationResult {
        message: Some(message),
        ..MutationResult::new(&mutation.id, MutationStatus::BadRequest)
    }
}

impl MutationTransport for SyncServer {
    fn send_mutations<'a>(
        &'a self,
        actor: &'a ActorContext,
        mutations: &'a [Mutation],
    ) -> BoxFuture<'a, entrysync_core::Result<Vec<MutationResult>>> {
        Box::pin(async move { Ok(self.apply_mutations(actor, mutations)) })
    }
}

impl TransactionSource for SyncServer {
    fn fetch_transactions<'a>(
        &'a self,
        root_id: &'a str,
        after_version: i64,
        limit: usize,
    ) -> BoxFuture<'a, entrysync_core::Result<Vec<EntryTransaction>>> {
        Box::pin(async move {
            let limit = self.config.clamp_limit(limit);
            Ok(self.repo.pull_transactions(root_id, after_version, limit)?)
        })
    }

    fn fetch_interactions<'a>(
        &'a self,
        root_id: &'a str,
        after_version: i64,
        limit: usize,
    ) -> BoxFuture<'a, entrysync_core::Result<Vec<EntryInteraction>>> {
        Box::pin(async move {
            let limit = self.config.clamp_limit(limit);
            Ok(self.repo.pull_interactions(root_id, after_version, limit)?)
        })
    }
}
