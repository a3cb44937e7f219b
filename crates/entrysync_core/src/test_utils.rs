//! Test utilities for entrysync_core

use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::engine::EntrySyncEngine;
use crate::events::EntryEvent;
use crate::store::WorkspaceStore;
use crate::types::{
    ActorContext, Attributes, Entry, EntryTransaction, Operation, generate_id, now,
};

/// An entry with `{type: page, name: A}` attributes.
pub fn sample_entry(id: &str, root_id: &str, transaction_id: &str) -> Entry {
    Entry {
        id: id.to_string(),
        root_id: root_id.to_string(),
        attributes: page("A"),
        created_at: now(),
        created_by: "u1".to_string(),
        updated_at: None,
        updated_by: None,
        transaction_id: transaction_id.to_string(),
    }
}

/// An unsynced transaction with a fresh id.
pub fn sample_transaction(
    entry_id: &str,
    operation: Operation,
    data: Option<Vec<u8>>,
) -> EntryTransaction {
    EntryTransaction {
        id: generate_id(),
        entry_id: entry_id.to_string(),
        root_id: entry_id.to_string(),
        operation,
        data,
        created_at: now(),
        created_by: "u1".to_string(),
        version: 0,
        server_created_at: None,
    }
}

/// Page attributes with the given name.
pub fn page(name: &str) -> Attributes {
    attributes(json!({"type": "page", "name": name}))
}

/// Convert a JSON object literal into attributes.
pub fn attributes(value: serde_json::Value) -> Attributes {
    value.as_object().cloned().unwrap()
}

/// Updater setting the `name` attribute.
pub fn rename(name: &str) -> impl Fn(&Attributes) -> Attributes {
    let name = name.to_string();
    move |attrs: &Attributes| {
        let mut attrs = attrs.clone();
        attrs.insert("name".into(), json!(name));
        attrs
    }
}

/// Copy of `transaction` as the server would return it.
pub fn stamp(transaction: &EntryTransaction, version: i64) -> EntryTransaction {
    EntryTransaction {
        version,
        server_created_at: Some(now()),
        ..transaction.clone()
    }
}

/// An engine on an in-memory store that records the events it emits.
pub struct TestReplica {
    pub engine: EntrySyncEngine,
    pub events: Arc<Mutex<Vec<EntryEvent>>>,
}

impl TestReplica {
    pub fn new(user_id: &str) -> Self {
        let store = Arc::new(WorkspaceStore::in_memory().unwrap());
        Self::with_engine(
            EntrySyncEngine::builder(store, ActorContext::new("acct", "ws", user_id)).build(),
        )
    }

    pub fn with_engine(engine: EntrySyncEngine) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        engine.events().subscribe(Arc::new(move |event: &EntryEvent| {
            sink.lock().unwrap().push(event.clone());
        }));
        Self { engine, events }
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn event_kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
    }
}
