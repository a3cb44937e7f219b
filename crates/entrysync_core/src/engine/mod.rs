//! Entry synchronization engine.
//!
//! [`EntrySyncEngine`] owns every write to the local replica. There are four
//! write paths, one per submodule:
//!
//! - `local`: optimistic create / update / delete issued by the local actor.
//!   Each commits the entry row, a transaction and an outbox mutation in one
//!   SQL transaction, then triggers a sync.
//! - `server`: idempotent application of transactions committed by the
//!   server of record.
//! - `revert`: rollback of local transactions the server rejected.
//! - `interactions`: seen/opened tracking.
//!
//! Attribute state is never written directly. Every write replays the
//! entry's transaction log into a [`CrdtDocument`], applies its change there,
//! and stores the materialized result, so the stored attributes always equal
//! a replay of the log.
//!
//! Writes that replace an existing row are guarded by the row's
//! `transaction_id` and retried through [`with_retries`] when another writer
//! got there first.

use std::sync::Arc;

use crate::capabilities::{
    AllowAll, AttributeTextExtractor, Authorizer, NoopSyncTrigger, SyncTrigger, TextExtractor,
};
use crate::config::SyncConfig;
use crate::crdt::{CrdtDocument, SchemaRegistry};
use crate::error::{Result, SyncError};
use crate::events::{EntryEvent, EventBus};
use crate::store::{WorkspaceStore, entries, mutations, texts, transactions};
use crate::types::{ActorContext, Attributes, Entry, EntryText, EntryTransaction, Mutation};

mod interactions;
mod local;
mod retry;
mod revert;
mod server;

pub use retry::{Attempt, with_retries};

/// The entry synchronization engine for one replica.
pub struct EntrySyncEngine {
    store: Arc<WorkspaceStore>,
    actor: ActorContext,
    config: SyncConfig,
    schemas: SchemaRegistry,
    authorizer: Arc<dyn Authorizer>,
    text_extractor: Arc<dyn TextExtractor>,
    sync_trigger: Arc<dyn SyncTrigger>,
    events: Arc<EventBus>,
}

impl EntrySyncEngine {
    /// Start building an engine over `store` acting as `actor`.
    pub fn builder(store: Arc<WorkspaceStore>, actor: ActorContext) -> EngineBuilder {
        EngineBuilder {
            store,
            actor,
            config: SyncConfig::default(),
            schemas: SchemaRegistry::with_defaults(),
            authorizer: Arc::new(AllowAll),
            text_extractor: Arc::new(AttributeTextExtractor::default()),
            sync_trigger: Arc::new(NoopSyncTrigger),
            events: Arc::new(EventBus::new()),
        }
    }

    /// The local actor.
    pub fn actor(&self) -> &ActorContext {
        &self.actor
    }

    /// Active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Event bus the engine emits on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Underlying replica store.
    pub fn store(&self) -> &Arc<WorkspaceStore> {
        &self.store
    }

    /// Current state of an entry.
    pub fn get_entry(&self, id: &str) -> Result<Option<Entry>> {
        self.store.read(|conn| entries::get(conn, id))
    }

    /// Every entry of a hierarchy, root included.
    pub fn list_entries_by_root(&self, root_id: &str) -> Result<Vec<Entry>> {
        self.store.read(|conn| entries::list_by_root(conn, root_id))
    }

    /// Transaction log of an entry in replay order.
    pub fn list_entry_transactions(&self, entry_id: &str) -> Result<Vec<EntryTransaction>> {
        self.store.read(|conn| transactions::list_for_entry(conn, entry_id))
    }

    /// Outbox contents, oldest first.
    pub fn list_pending_mutations(&self, limit: usize) -> Result<Vec<Mutation>> {
        self.store.read(|conn| mutations::list_pending(conn, limit))
    }

    /// Search the text index.
    pub fn search_texts(&self, query: &str) -> Result<Vec<EntryText>> {
        self.store.read(|conn| texts::search(conn, query))
    }

    fn emit(&self, event: EntryEvent) {
        self.events.emit(&event);
    }

    fn extract_text(&self, entry: &Entry) -> Option<EntryText> {
        self.text_extractor.extract_text(&entry.id, &entry.attributes)
    }

    fn require_entry(&self, id: &str) -> Result<Entry> {
        self.get_entry(id)?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    /// Resolve the root of `entry` (the entry itself when it is a root).
    fn root_of(&self, entry: &Entry) -> Result<Entry> {
        if entry.is_root() {
            Ok(entry.clone())
        } else {
            self.require_entry(&entry.root_id)
        }
    }

    /// Read an entry and its log under one lock so they are consistent.
    fn snapshot(&self, entry_id: &str) -> Result<(Option<Entry>, Vec<EntryTransaction>)> {
        self.store.read(|conn| {
            Ok((
                entries::get(conn, entry_id)?,
                transactions::list_for_entry(conn, entry_id)?,
            ))
        })
    }
}

impl std::fmt::Debug for EntrySyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntrySyncEngine")
            .field("actor", &self.actor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Rebuild the document of an entry from its log.
///
/// Deletes carry no update and are skipped.
pub(crate) fn replay_log(log: &[EntryTransaction]) -> Result<CrdtDocument> {
    CrdtDocument::replay(log.iter().filter_map(|t| t.data.as_deref()))
}

/// Materialize `log` as the attributes of an entry.
pub(crate) fn materialize_log(log: &[EntryTransaction]) -> Result<Attributes> {
    Ok(replay_log(log)?.materialize())
}

/// Builder for [`EntrySyncEngine`].
pub struct EngineBuilder {
    store: Arc<WorkspaceStore>,
    actor: ActorContext,
    config: SyncConfig,
    schemas: SchemaRegistry,
    authorizer: Arc<dyn Authorizer>,
    text_extractor: Arc<dyn TextExtractor>,
    sync_trigger: Arc<dyn SyncTrigger>,
    events: Arc<EventBus>,
}

impl EngineBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `schemas` instead of [`SchemaRegistry::with_defaults`].
    pub fn schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Permission checks for local writes (default: [`AllowAll`]).
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Search index feed (default: [`AttributeTextExtractor`]).
    pub fn text_extractor(mut self, text_extractor: Arc<dyn TextExtractor>) -> Self {
        self.text_extractor = text_extractor;
        self
    }

    /// Hook called after local writes (default: [`NoopSyncTrigger`]).
    pub fn sync_trigger(mut self, sync_trigger: Arc<dyn SyncTrigger>) -> Self {
        self.sync_trigger = sync_trigger;
        self
    }

    /// Share an existing event bus.
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Finish building.
    pub fn build(self) -> EntrySyncEngine {
        EntrySyncEngine {
            store: self.store,
            actor: self.actor,
            config: self.config,
            schemas: self.schemas,
            authorizer: self.authorizer,
            text_extractor: self.text_extractor,
            sync_trigger: self.sync_trigger,
            events: self.events,
        }
    }
}
