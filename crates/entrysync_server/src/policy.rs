//! Commit authorization.

use entrysync_core::types::{ActorContext, EntryTransaction};

/// Decides whether an actor may commit a transaction.
///
/// Consulted after structural validation, so the transaction is known to be
/// well-formed and to target a live entry (or create a new one).
pub trait CommitPolicy: Send + Sync {
    /// Return `true` to allow the commit.
    fn allows(&self, actor: &ActorContext, transaction: &EntryTransaction) -> bool;
}

impl<F> CommitPolicy for F
where
    F: Fn(&ActorContext, &EntryTransaction) -> bool + Send + Sync,
{
    fn allows(&self, actor: &ActorContext, transaction: &EntryTransaction) -> bool {
        self(actor, transaction)
    }
}

/// Policy that allows every commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllCommits;

impl CommitPolicy for AllowAllCommits {
    fn allows(&self, _actor: &ActorContext, _transaction: &EntryTransaction) -> bool {
        true
    }
}
