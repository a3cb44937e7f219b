//! Local write path.

use super::{EntrySyncEngine, replay_log};
use crate::crdt::CrdtDocument;
use crate::engine::retry::{Attempt, with_retries};
use crate::error::{Result, SyncError};
use crate::events::EntryEvent;
use crate::store::{entries, mutations, texts, transactions};
use crate::types::{Attributes, Entry, EntryTransaction, Mutation, Operation, generate_id, now};

impl EntrySyncEngine {
    fn new_transaction(
        &self,
        entry_id: &str,
        root_id: &str,
        operation: Operation,
        data: Option<Vec<u8>>,
    ) -> EntryTransaction {
        EntryTransaction {
            id: generate_id(),
            entry_id: entry_id.to_string(),
            root_id: root_id.to_string(),
            operation,
            data,
            created_at: now(),
            created_by: self.actor.user_id.clone(),
            version: 0,
            server_created_at: None,
        }
    }

    /// Create an entry.
    ///
    /// With a `parent_id` the entry joins the parent's hierarchy; without one
    /// it becomes a root. A fresh id is generated when `id` is `None`.
    ///
    /// Returns `Ok(None)` if the attributes produce no document change.
    pub async fn create_entry(
        &self,
        id: Option<String>,
        attributes: Attributes,
        parent_id: Option<&str>,
    ) -> Result<Option<Entry>> {
        let id = id.unwrap_or_else(generate_id);
        let root = match parent_id {
            Some(parent_id) => {
                let parent = self.require_entry(parent_id)?;
                Some(self.root_of(&parent)?)
            }
            None => None,
        };
        let root_id = root.as_ref().map_or_else(|| id.clone(), |r| r.id.clone());

        if !self
            .authorizer
            .can_create(&self.actor, root.as_ref(), &attributes)
            .await
        {
            return Err(SyncError::unauthorized("create", &id));
        }

        let schema = self.schemas.schema_for(&attributes)?;
        let document = CrdtDocument::new();
        let Some(update) = document.diff_attributes(schema, &attributes)? else {
            log::debug!("Create of {} produced no change, skipping", id);
            return Ok(None);
        };

        let transaction = self.new_transaction(&id, &root_id, Operation::Create, Some(update));
        let entry = Entry {
            id,
            root_id,
            attributes: document.materialize(),
            created_at: transaction.created_at,
            created_by: transaction.created_by.clone(),
            updated_at: None,
            updated_by: None,
            transaction_id: transaction.id.clone(),
        };
        let mutation = Mutation::for_transaction(&transaction)?;
        let text = self.extract_text(&entry);

        self.store.atomic(|tx| {
            if !entries::insert(tx, &entry)? {
                return Err(SyncError::Failed(format!("entry {} already exists", entry.id)));
            }
            transactions::insert(tx, &transaction)?;
            mutations::insert(tx, &mutation)?;
            texts::replace(tx, &entry.id, text.as_ref())?;
            Ok(())
        })?;

        log::debug!("Created entry {} ({})", entry.id, transaction.id);
        self.emit(EntryEvent::created(&self.actor, entry.clone()));
        self.sync_trigger.trigger_sync();
        Ok(Some(entry))
    }

    /// Update an entry's attributes.
    ///
    /// `updater` receives the current attributes and returns the desired
    /// ones. It may run several times when concurrent writers force a retry,
    /// so it should be a pure function of its input. If the result equals the
    /// current state nothing is written and the current entry is returned.
    pub async fn update_entry<F>(&self, entry_id: &str, updater: F) -> Result<Entry>
    where
        F: Fn(&Attributes) -> Attributes,
    {
        let updater = &updater;
        with_retries(self.config.max_update_retries, "update entry", move |_| {
            self.try_update_entry(entry_id, updater)
        })
        .await
    }

    async fn try_update_entry<F>(&self, entry_id: &str, updater: &F) -> Result<Attempt<Entry>>
    where
        F: Fn(&Attributes) -> Attributes,
    {
        let (entry, log) = self.snapshot(entry_id)?;
        let entry = entry.ok_or_else(|| SyncError::NotFound(entry_id.to_string()))?;
        let root = self.root_of(&entry)?;

        let candidate = updater(&entry.attributes);
        if !self
            .authorizer
            .can_update(&self.actor, &root, &entry, &candidate)
            .await
        {
            return Err(SyncError::unauthorized("update", entry_id));
        }

        let schema = self.schemas.schema_for(&candidate)?;
        let document = replay_log(&log)?;
        let Some(update) = document.diff_attributes(schema, &candidate)? else {
            return Ok(Attempt::Done(entry));
        };

        let transaction =
            self.new_transaction(entry_id, &entry.root_id, Operation::Update, Some(update));
        let next = Entry {
            attributes: document.materialize(),
            updated_at: Some(transaction.created_at),
            updated_by: Some(transaction.created_by.clone()),
            transaction_id: transaction.id.clone(),
            ..entry.clone()
        };
        let mutation = Mutation::for_transaction(&transaction)?;
        let text = self.extract_text(&next);

        let written = self.store.atomic(|tx| {
            if !entries::update_cas(tx, &next, &entry.transaction_id)? {
                return Ok(false);
            }
            transactions::insert(tx, &transaction)?;
            mutations::insert(tx, &mutation)?;
            texts::replace(tx, entry_id, text.as_ref())?;
            Ok(true)
        })?;

        if !written {
            return Ok(Attempt::Retry);
        }

        self.emit(EntryEvent::updated(&self.actor, next.clone()));
        self.sync_trigger.trigger_sync();
        Ok(Attempt::Done(next))
    }

    /// Delete an entry.
    ///
    /// The entry row and its text index row go away immediately. The log and
    /// the interactions stay until the server acknowledges the delete, so a
    /// rejected delete can be reverted.
    pub async fn delete_entry(&self, entry_id: &str) -> Result<()> {
        let entry = self.require_entry(entry_id)?;
        let root = self.root_of(&entry)?;

        if !self
            .authorizer
            .can_delete(&self.actor, &root, &entry)
            .await
        {
            return Err(SyncError::unauthorized("delete", entry_id));
        }

        let transaction = self.new_transaction(entry_id, &entry.root_id, Operation::Delete, None);
        let mutation = Mutation::for_transaction(&transaction)?;

        let deleted = self.store.atomic(|tx| {
            if !entries::delete(tx, entry_id)? {
                return Ok(false);
            }
            texts::delete(tx, entry_id)?;
            transactions::insert(tx, &transaction)?;
            mutations::insert(tx, &mutation)?;
            Ok(true)
        })?;

        if !deleted {
            return Err(SyncError::NotFound(entry_id.to_string()));
        }

        log::debug!("Deleted entry {} ({})", entry_id, transaction.id);
        self.emit(EntryEvent::deleted(&self.actor, entry));
        self.sync_trigger.trigger_sync();
        Ok(())
    }
}
