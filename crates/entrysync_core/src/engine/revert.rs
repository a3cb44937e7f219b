//! Rollback of local transactions rejected by the server.
//!
//! A revert removes the rejected transaction from the log and recomputes the
//! entry from what survives, so the replica converges on the state the
//! server actually holds.

use super::{EntrySyncEngine, materialize_log};
use crate::engine::retry::{Attempt, with_retries};
use crate::error::Result;
use crate::events::EntryEvent;
use crate::store::{entries, interactions, texts, transactions};
use crate::types::{Entry, EntryTransaction, Operation};

/// Last-update fields derived from the newest surviving transaction.
fn last_update(
    last: &EntryTransaction,
) -> (Option<chrono::DateTime<chrono::Utc>>, Option<String>) {
    match last.operation {
        Operation::Create => (None, None),
        _ => (Some(last.created_at), Some(last.created_by.clone())),
    }
}

impl EntrySyncEngine {
    /// Revert a rejected transaction, dispatching on its operation.
    ///
    /// Returns whether the entry state changed.
    pub async fn revert_transaction(&self, transaction: &EntryTransaction) -> Result<bool> {
        match transaction.operation {
            Operation::Create => self.revert_create(transaction),
            Operation::Update => self.revert_update(transaction).await,
            Operation::Delete => self.revert_delete(transaction),
        }
    }

    /// Undo a rejected create: the entry disappears.
    pub fn revert_create(&self, transaction: &EntryTransaction) -> Result<bool> {
        let removed = self.store.atomic(|tx| {
            let entry = entries::get(tx, &transaction.entry_id)?;
            // Drop the rejected row even when the entry is already gone, or
            // reverting a later delete would resurrect it from the log
            transactions::delete(tx, &transaction.id)?;
            if entry.is_some() {
                entries::delete(tx, &transaction.entry_id)?;
                interactions::delete_for_entry(tx, &transaction.entry_id)?;
                texts::delete(tx, &transaction.entry_id)?;
            }
            Ok(entry)
        })?;

        match removed {
            Some(entry) => {
                log::debug!("Reverted create {} of {}", transaction.id, entry.id);
                self.emit(EntryEvent::deleted(&self.actor, entry));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Undo a rejected update by replaying the log without it.
    pub async fn revert_update(&self, transaction: &EntryTransaction) -> Result<bool> {
        with_retries(
            self.config.max_revert_retries,
            "revert update",
            move |_| async move { self.try_revert_update(transaction) },
        )
        .await
    }

    fn try_revert_update(&self, transaction: &EntryTransaction) -> Result<Attempt<bool>> {
        let (entry, log) = self.snapshot(&transaction.entry_id)?;
        if !log.iter().any(|t| t.id == transaction.id) {
            return Ok(Attempt::Done(false));
        }

        let Some(entry) = entry else {
            self.store.read(|conn| transactions::delete(conn, &transaction.id))?;
            return Ok(Attempt::Done(false));
        };

        let survivors: Vec<EntryTransaction> =
            log.into_iter().filter(|t| t.id != transaction.id).collect();
        let Some(last) = survivors.last() else {
            log::warn!(
                "Entry {} has no surviving transactions after reverting {}",
                entry.id,
                transaction.id
            );
            return Ok(Attempt::Done(false));
        };

        let (updated_at, updated_by) = last_update(last);
        let next = Entry {
            attributes: materialize_log(&survivors)?,
            updated_at,
            updated_by,
            transaction_id: last.id.clone(),
            ..entry.clone()
        };
        let text = self.extract_text(&next);

        let written = self.store.atomic(|tx| {
            if !entries::update_cas(tx, &next, &entry.transaction_id)? {
                return Ok(false);
            }
            transactions::delete(tx, &transaction.id)?;
            texts::replace(tx, &next.id, text.as_ref())?;
            Ok(true)
        })?;

        if !written {
            return Ok(Attempt::Retry);
        }

        log::debug!("Reverted update {} of {}", transaction.id, next.id);
        self.emit(EntryEvent::updated(&self.actor, next));
        Ok(Attempt::Done(true))
    }

    /// Undo a rejected delete by restoring the entry from its log.
    pub fn revert_delete(&self, transaction: &EntryTransaction) -> Result<bool> {
        let log = self.list_entry_transactions(&transaction.entry_id)?;
        let survivors: Vec<EntryTransaction> =
            log.into_iter().filter(|t| t.id != transaction.id).collect();

        let create = survivors.iter().find(|t| t.operation == Operation::Create);
        let (Some(create), Some(last)) = (create, survivors.last()) else {
            self.store.read(|conn| transactions::delete(conn, &transaction.id))?;
            return Ok(false);
        };

        let (updated_at, updated_by) = last_update(last);
        let entry = Entry {
            id: transaction.entry_id.clone(),
            root_id: transaction.root_id.clone(),
            attributes: materialize_log(&survivors)?,
            created_at: create.created_at,
            created_by: create.created_by.clone(),
            updated_at,
            updated_by,
            transaction_id: last.id.clone(),
        };
        let text = self.extract_text(&entry);

        let restored = self.store.atomic(|tx| {
            let restored = entries::restore(tx, &entry, &transaction.id)?;
            transactions::delete(tx, &transaction.id)?;
            if restored {
                texts::replace(tx, &entry.id, text.as_ref())?;
            }
            Ok(restored)
        })?;

        if restored {
            log::debug!("Reverted delete {} of {}", transaction.id, entry.id);
            self.emit(EntryEvent::created(&self.actor, entry));
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use crate::crdt::CrdtDocument;
    use crate::store::{entries, transactions};
    use crate::test_utils::{TestReplica, page, rename, sample_entry, sample_transaction};
    use crate::types::Operation;
    use futures_lite::future::block_on;

    #[test]
    fn test_revert_update_restores_previous_state() {
        let replica = TestReplica::new("alice");
        let engine = &replica.engine;
        let e1 = block_on(engine.create_entry(Some("E1".into()), page("A"), None))
            .unwrap()
            .unwrap();
        block_on(engine.update_entry("E1", rename("B"))).unwrap();

        let log = engine.list_entry_transactions("E1").unwrap();
        let (t1, t2) = (log[0].clone(), log[1].clone());
        assert_eq!(engine.get_entry("E1").unwrap().unwrap().attributes["name"], "B");

        assert!(block_on(engine.revert_transaction(&t2)).unwrap());

        let reverted = engine.get_entry("E1").unwrap().unwrap();
        assert_eq!(reverted.attributes, e1.attributes);
        assert_eq!(reverted.attributes["name"], "A");
        assert_eq!(reverted.transaction_id, t1.id);
        assert_eq!(reverted.updated_at, None);
        assert_eq!(engine.list_entry_transactions("E1").unwrap(), vec![t1]);

        // Reverting again is a no-op
        assert!(!block_on(engine.revert_transaction(&t2)).unwrap());
    }

    #[test]
    fn test_revert_middle_update_keeps_later_changes() {
        let replica = TestReplica::new("alice");
        let engine = &replica.engine;
        block_on(engine.create_entry(Some("E1".into()), page("A"), None)).unwrap();
        block_on(engine.update_entry("E1", rename("B"))).unwrap();
        block_on(engine.update_entry("E1", |attrs| {
            let mut attrs = attrs.clone();
            attrs.insert("content".into(), serde_json::json!("body"));
            attrs
        }))
        .unwrap();

        let log = engine.list_entry_transactions("E1").unwrap();
        assert!(block_on(engine.revert_transaction(&log[1])).unwrap());

        let entry = engine.get_entry("E1").unwrap().unwrap();
        assert_eq!(entry.attributes["name"], "A");
        assert_eq!(entry.attributes["content"], "body");
        assert_eq!(entry.transaction_id, log[2].id);
        assert_eq!(entry.updated_at, Some(log[2].created_at));
    }

    #[test]
    fn test_revert_create_removes_entry() {
        let replica = TestReplica::new("alice");
        let engine = &replica.engine;
        block_on(engine.create_entry(Some("E1".into()), page("A"), None)).unwrap();
        block_on(engine.mark_entry_seen("E1")).unwrap();
        let create = engine.list_entry_transactions("E1").unwrap()[0].clone();

        assert!(block_on(engine.revert_transaction(&create)).unwrap());
        assert!(engine.get_entry("E1").unwrap().is_none());
        assert!(engine.list_entry_transactions("E1").unwrap().is_empty());
        assert!(engine.list_entry_interactions("E1").unwrap().is_empty());
        assert!(engine.search_texts("A").unwrap().is_empty());

        assert!(!block_on(engine.revert_transaction(&create)).unwrap());
    }

    #[test]
    fn test_revert_delete_restores_entry() {
        let replica = TestReplica::new("alice");
        let engine = &replica.engine;
        block_on(engine.create_entry(Some("E1".into()), page("A"), None)).unwrap();
        block_on(engine.update_entry("E1", rename("B"))).unwrap();
        let before = engine.get_entry("E1").unwrap().unwrap();

        block_on(engine.delete_entry("E1")).unwrap();
        let delete = engine.list_entry_transactions("E1").unwrap()[2].clone();

        assert!(block_on(engine.revert_transaction(&delete)).unwrap());
        assert_eq!(engine.get_entry("E1").unwrap().unwrap(), before);
        assert_eq!(engine.list_entry_transactions("E1").unwrap().len(), 2);
        assert_eq!(engine.search_texts("B").unwrap().len(), 1);
    }

    #[test]
    fn test_rejected_create_then_delete_does_not_resurrect() {
        let replica = TestReplica::new("alice");
        let engine = &replica.engine;
        block_on(engine.create_entry(Some("E1".into()), page("A"), None)).unwrap();
        block_on(engine.delete_entry("E1")).unwrap();
        let log = engine.list_entry_transactions("E1").unwrap();

        assert!(!block_on(engine.revert_transaction(&log[0])).unwrap());
        assert!(!block_on(engine.revert_transaction(&log[1])).unwrap());
        assert!(engine.get_entry("E1").unwrap().is_none());
        assert!(engine.list_entry_transactions("E1").unwrap().is_empty());
    }

    #[test]
    fn test_revert_update_overwritten_by_later_update() {
        let replica = TestReplica::new("alice");
        let engine = &replica.engine;
        block_on(engine.create_entry(Some("E1".into()), page("A"), None)).unwrap();
        block_on(engine.update_entry("E1", rename("B"))).unwrap();
        block_on(engine.update_entry("E1", rename("C"))).unwrap();
        let log = engine.list_entry_transactions("E1").unwrap();
        let (t1, t2, t3) = (log[0].clone(), log[1].clone(), log[2].clone());

        assert!(block_on(engine.revert_transaction(&t2)).unwrap());

        // The later write was made on top of the reverted value and cannot
        // integrate without it, on this replica or any other
        let committed = CrdtDocument::replay([
            t1.update_data().unwrap(),
            t3.update_data().unwrap(),
        ])
        .unwrap();
        let entry = engine.get_entry("E1").unwrap().unwrap();
        assert_eq!(entry.attributes, committed.materialize());
        assert_eq!(entry.attributes["name"], "A");
        assert_eq!(entry.attributes["type"], "page");
        assert_eq!(entry.transaction_id, t3.id);
        assert_eq!(engine.list_entry_transactions("E1").unwrap(), vec![t1, t3]);
    }

    #[test]
    fn test_revert_update_without_survivors_keeps_entry() {
        let replica = TestReplica::new("alice");
        let engine = &replica.engine;
        let update = sample_transaction("E1", Operation::Update, Some(vec![0, 0]));
        let entry = sample_entry("E1", "E1", &update.id);
        engine
            .store()
            .read(|conn| {
                entries::insert(conn, &entry)?;
                transactions::insert(conn, &update)
            })
            .unwrap();

        assert!(!block_on(engine.revert_transaction(&update)).unwrap());
        assert_eq!(engine.get_entry("E1").unwrap().unwrap(), entry);
        assert_eq!(engine.list_entry_transactions("E1").unwrap(), vec![update]);
        assert_eq!(replica.event_count(), 0);
    }

    #[test]
    fn test_revert_delete_without_create_drops_only_its_row() {
        let replica = TestReplica::new("alice");
        let engine = &replica.engine;
        let update = sample_transaction("E1", Operation::Update, Some(vec![0, 0]));
        let delete = sample_transaction("E1", Operation::Delete, None);
        engine
            .store()
            .read(|conn| {
                transactions::insert(conn, &update)?;
                transactions::insert(conn, &delete)
            })
            .unwrap();

        assert!(!block_on(engine.revert_transaction(&delete)).unwrap());
        assert!(engine.get_entry("E1").unwrap().is_none());
        assert_eq!(engine.list_entry_transactions("E1").unwrap(), vec![update]);

        // Only the delete row left
        let lone = sample_transaction("E2", Operation::Delete, None);
        engine
            .store()
            .read(|conn| transactions::insert(conn, &lone))
            .unwrap();
        assert!(!block_on(engine.revert_transaction(&lone)).unwrap());
        assert!(engine.list_entry_transactions("E2").unwrap().is_empty());
        assert_eq!(replica.event_count(), 0);
    }
}
