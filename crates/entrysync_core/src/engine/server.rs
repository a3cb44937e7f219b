//! Application of transactions committed by the server of record.
//!
//! Every path here is idempotent: a transaction already present with the
//! same server stamp is ignored, so pulls can overlap or repeat freely.

use super::{EntrySyncEngine, replay_log};
use crate::crdt::CrdtDocument;
use crate::engine::retry::{Attempt, with_retries};
use crate::error::Result;
use crate::events::EntryEvent;
use crate::store::{entries, interactions, texts, transactions};
use crate::types::{Entry, EntryTransaction, Operation};

impl EntrySyncEngine {
    /// Apply a transaction pulled from the server.
    ///
    /// Returns whether local state changed.
    pub async fn apply_server_transaction(&self, transaction: &EntryTransaction) -> Result<bool> {
        let known = self.store.read(|conn| transactions::get(conn, &transaction.id))?;

        if let Some(known) = known {
            if known.same_server_stamp(transaction) {
                log::debug!("Transaction {} already applied", transaction.id);
                return Ok(false);
            }
            return self.promote_transaction(transaction);
        }

        match transaction.operation {
            Operation::Create => self.apply_server_create(transaction),
            Operation::Update => self.apply_server_update(transaction).await,
            Operation::Delete => self.apply_server_delete(transaction),
        }
    }

    /// A local transaction came back from the server: record its stamp.
    ///
    /// An acknowledged delete is terminal, so whatever the local delete kept
    /// around for a potential revert is purged.
    fn promote_transaction(&self, transaction: &EntryTransaction) -> Result<bool> {
        if transaction.operation == Operation::Delete {
            log::debug!(
                "Delete {} acknowledged, purging entry {}",
                transaction.id,
                transaction.entry_id
            );
            return self.purge_entry(&transaction.entry_id);
        }

        self.store.read(|conn| {
            transactions::stamp_server_fields(
                conn,
                &transaction.id,
                transaction.version,
                transaction.server_created_at.as_ref(),
            )
        })
    }

    fn apply_server_create(&self, transaction: &EntryTransaction) -> Result<bool> {
        let document = CrdtDocument::replay([transaction.update_data()?])?;
        let entry = Entry {
            id: transaction.entry_id.clone(),
            root_id: transaction.root_id.clone(),
            attributes: document.materialize(),
            created_at: transaction.created_at,
            created_by: transaction.created_by.clone(),
            updated_at: None,
            updated_by: None,
            transaction_id: transaction.id.clone(),
        };
        let text = self.extract_text(&entry);

        let inserted = self.store.atomic(|tx| {
            if !entries::insert(tx, &entry)? {
                return Ok(false);
            }
            transactions::insert(tx, transaction)?;
            texts::replace(tx, &entry.id, text.as_ref())?;
            Ok(true)
        })?;

        if !inserted {
            log::warn!(
                "Entry {} already exists, ignoring server create {}",
                entry.id,
                transaction.id
            );
            return Ok(false);
        }

        self.emit(EntryEvent::created(&self.actor, entry));
        Ok(true)
    }

    async fn apply_server_update(&self, transaction: &EntryTransaction) -> Result<bool> {
        with_retries(
            self.config.max_update_retries,
            "apply server update",
            move |_| async move { self.try_apply_server_update(transaction) },
        )
        .await
    }

    fn try_apply_server_update(&self, transaction: &EntryTransaction) -> Result<Attempt<bool>> {
        let (entry, log) = self.snapshot(&transaction.entry_id)?;
        let Some(entry) = entry else {
            log::warn!(
                "Skipping server update {} for missing entry {}",
                transaction.id,
                transaction.entry_id
            );
            return Ok(Attempt::Done(false));
        };

        let document = replay_log(&log)?;
        document.apply_update(transaction.update_data()?)?;

        let next = Entry {
            attributes: document.materialize(),
            updated_at: Some(transaction.created_at),
            updated_by: Some(transaction.created_by.clone()),
            transaction_id: transaction.id.clone(),
            ..entry.clone()
        };
        let text = self.extract_text(&next);

        let written = self.store.atomic(|tx| {
            if !entries::update_cas(tx, &next, &entry.transaction_id)? {
                return Ok(false);
            }
            transactions::insert(tx, transaction)?;
            texts::replace(tx, &next.id, text.as_ref())?;
            Ok(true)
        })?;

        if !written {
            return Ok(Attempt::Retry);
        }

        self.emit(EntryEvent::updated(&self.actor, next));
        Ok(Attempt::Done(true))
    }

    fn apply_server_delete(&self, transaction: &EntryTransaction) -> Result<bool> {
        self.purge_entry(&transaction.entry_id)
    }

    /// Remove an entry with its log, interactions and text row.
    fn purge_entry(&self, entry_id: &str) -> Result<bool> {
        let removed = self.store.atomic(|tx| {
            let entry = entries::get(tx, entry_id)?;
            entries::delete(tx, entry_id)?;
            let log_rows = transactions::delete_for_entry(tx, entry_id)?;
            interactions::delete_for_entry(tx, entry_id)?;
            texts::delete(tx, entry_id)?;
            Ok((entry, log_rows))
        })?;

        match removed {
            (Some(entry), _) => {
                self.emit(EntryEvent::deleted(&self.actor, entry));
                Ok(true)
            }
            (None, log_rows) => Ok(log_rows > 0),
        }
    }
}
