//! Seen/opened tracking.

use super::EntrySyncEngine;
use crate::error::Result;
use crate::events::EntryEvent;
use crate::store::{interactions, mutations};
use crate::types::{EntryInteraction, InteractionMark, Mutation, MutationType, now};

impl EntrySyncEngine {
    /// Store an interaction pulled from the server.
    ///
    /// The row is written when it is new or its version differs from the
    /// stored one. Returns whether it was written.
    pub async fn sync_server_entry_interaction(
        &self,
        interaction: &EntryInteraction,
    ) -> Result<bool> {
        let changed = self
            .store
            .atomic(|tx| interactions::upsert_if_version_differs(tx, interaction))?;

        if changed {
            self.emit(EntryEvent::interaction_updated(
                &self.actor,
                interaction.clone(),
            ));
        }
        Ok(changed)
    }

    /// Record that the local actor saw an entry.
    pub async fn mark_entry_seen(&self, entry_id: &str) -> Result<EntryInteraction> {
        self.mark_interaction(entry_id, MutationType::MarkEntrySeen)
    }

    /// Record that the local actor opened an entry.
    pub async fn mark_entry_opened(&self, entry_id: &str) -> Result<EntryInteraction> {
        self.mark_interaction(entry_id, MutationType::MarkEntryOpened)
    }

    fn mark_interaction(&self, entry_id: &str, kind: MutationType) -> Result<EntryInteraction> {
        let entry = self.require_entry(entry_id)?;
        let collaborator_id = &self.actor.user_id;
        let mark = InteractionMark {
            entry_id: entry.id.clone(),
            root_id: entry.root_id.clone(),
            collaborator_id: collaborator_id.clone(),
            at: now(),
        };
        let mutation = Mutation::for_interaction(kind, &mark)?;

        let interaction = self.store.atomic(|tx| {
            let mut interaction = interactions::get(tx, entry_id, collaborator_id)?
                .unwrap_or_else(|| {
                    EntryInteraction::empty(entry_id, collaborator_id, &entry.root_id)
                });
            if kind == MutationType::MarkEntryOpened {
                interaction.mark_opened(mark.at);
            } else {
                interaction.mark_seen(mark.at);
            }
            interactions::upsert(tx, &interaction)?;
            mutations::insert(tx, &mutation)?;
            Ok(interaction)
        })?;

        self.emit(EntryEvent::interaction_updated(
            &self.actor,
            interaction.clone(),
        ));
        self.sync_trigger.trigger_sync();
        Ok(interaction)
    }

    /// Interaction of one collaborator with an entry.
    pub fn get_entry_interaction(
        &self,
        entry_id: &str,
        collaborator_id: &str,
    ) -> Result<Option<EntryInteraction>> {
        self.store.read(|conn| interactions::get(conn, entry_id, collaborator_id))
    }

    /// All interactions recorded for an entry.
    pub fn list_entry_interactions(&self, entry_id: &str) -> Result<Vec<EntryInteraction>> {
        self.store.read(|conn| interactions::list_for_entry(conn, entry_id))
    }
}

#[cfg(test)]
mod tests {
    use crate::error::SyncError;
    use crate::test_utils::{TestReplica, page};
    use crate::types::{EntryInteraction, MutationType, now};
    use futures_lite::future::block_on;

    #[test]
    fn test_mark_seen_then_opened() {
        let replica = TestReplica::new("alice");
        let engine = &replica.engine;
        block_on(engine.create_entry(Some("E1".into()), page("A"), None)).unwrap();

        let seen = block_on(engine.mark_entry_seen("E1")).unwrap();
        assert!(seen.first_seen_at.is_some());
        assert!(seen.first_opened_at.is_none());
        assert_eq!(seen.version, 0);

        let opened = block_on(engine.mark_entry_opened("E1")).unwrap();
        assert_eq!(opened.first_seen_at, seen.first_seen_at);
        assert!(opened.last_opened_at.is_some());
        assert_eq!(opened.last_seen_at, opened.last_opened_at);

        let kinds: Vec<_> = engine
            .list_pending_mutations(10)
            .unwrap()
            .into_iter()
            .map(|m| m.mutation_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                MutationType::ApplyCreateTransaction,
                MutationType::MarkEntrySeen,
                MutationType::MarkEntryOpened
            ]
        );
    }

    #[test]
    fn test_mark_missing_entry() {
        let replica = TestReplica::new("alice");
        assert!(matches!(
            block_on(replica.engine.mark_entry_seen("nope")),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_server_interaction_version_gate() {
        let replica = TestReplica::new("alice");
        let engine = &replica.engine;

        let mut interaction = EntryInteraction::empty("E1", "bob", "E1");
        interaction.mark_seen(now());
        interaction.version = 5;

        assert!(block_on(engine.sync_server_entry_interaction(&interaction)).unwrap());
        let events = replica.event_count();
        assert!(!block_on(engine.sync_server_entry_interaction(&interaction)).unwrap());
        assert_eq!(replica.event_count(), events);

        interaction.version = 6;
        interaction.mark_opened(now());
        assert!(block_on(engine.sync_server_entry_interaction(&interaction)).unwrap());
        assert_eq!(
            engine.get_entry_interaction("E1", "bob").unwrap(),
            Some(interaction)
        );
    }
}
