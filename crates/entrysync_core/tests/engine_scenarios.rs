//! End-to-end scenarios against the public engine API.

use std::sync::{Arc, Mutex};

use entrysync_core::EntrySyncEngine;
use entrysync_core::events::EntryEvent;
use entrysync_core::store::WorkspaceStore;
use entrysync_core::types::{ActorContext, Attributes, Operation};
use futures_lite::future::block_on;
use serde_json::{Value, json};

fn attrs(value: Value) -> Attributes {
    value.as_object().cloned().unwrap()
}

fn engine_on(store: Arc<WorkspaceStore>) -> EntrySyncEngine {
    EntrySyncEngine::builder(store, ActorContext::new("acct", "ws", "alice")).build()
}

#[test]
fn create_update_revert_scenario() {
    let engine = engine_on(Arc::new(WorkspaceStore::in_memory().unwrap()));
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.events().subscribe(Arc::new(move |event: &EntryEvent| {
        sink.lock().unwrap().push(event.kind());
    }));

    block_on(engine.create_entry(
        Some("E1".into()),
        attrs(json!({"type": "page", "name": "A"})),
        None,
    ))
    .unwrap();
    let t1 = engine.list_entry_transactions("E1").unwrap()[0].clone();

    block_on(engine.update_entry("E1", |current| {
        let mut next = current.clone();
        next.insert("name".into(), json!("B"));
        next
    }))
    .unwrap();
    let t2 = engine.list_entry_transactions("E1").unwrap()[1].clone();
    assert_eq!(t2.operation, Operation::Update);

    block_on(engine.revert_transaction(&t2)).unwrap();

    let entry = engine.get_entry("E1").unwrap().unwrap();
    assert_eq!(entry.attributes, attrs(json!({"type": "page", "name": "A"})));
    assert_eq!(entry.transaction_id, t1.id);
    assert_eq!(engine.list_entry_transactions("E1").unwrap(), vec![t1]);
    assert_eq!(
        *events.lock().unwrap(),
        vec!["entry_created", "entry_updated", "entry_updated"]
    );
}

#[test]
fn replica_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replica.db");

    {
        let engine = engine_on(Arc::new(WorkspaceStore::open(&path).unwrap()));
        block_on(engine.create_entry(
            Some("E1".into()),
            attrs(json!({"type": "page", "name": "A", "content": "draft"})),
            None,
        ))
        .unwrap();
        block_on(engine.update_entry("E1", |current| {
            let mut next = current.clone();
            next.insert("content".into(), json!("final draft"));
            next
        }))
        .unwrap();
    }

    let engine = engine_on(Arc::new(WorkspaceStore::open(&path).unwrap()));
    let entry = engine.get_entry("E1").unwrap().unwrap();
    assert_eq!(entry.attributes["content"], "final draft");
    assert_eq!(engine.list_pending_mutations(10).unwrap().len(), 2);
    assert_eq!(engine.search_texts("final").unwrap()[0].id, "E1");

    // Further edits build on the replayed log
    let edited = block_on(engine.update_entry("E1", |current| {
        let mut next = current.clone();
        next.insert("name".into(), json!("B"));
        next
    }))
    .unwrap();
    assert_eq!(edited.attributes["content"], "final draft");
    assert_eq!(edited.attributes["name"], "B");
}

#[test]
fn database_records_merge_field_by_field() {
    let engine = engine_on(Arc::new(WorkspaceStore::in_memory().unwrap()));
    block_on(engine.create_entry(
        Some("S1".into()),
        attrs(json!({"type": "space", "name": "Team"})),
        None,
    ))
    .unwrap();
    block_on(engine.create_entry(
        Some("D1".into()),
        attrs(json!({
            "type": "database",
            "name": "Tasks",
            "parentId": "S1",
            "fields": {"status": {"name": "Status", "type": "select"}}
        })),
        Some("S1"),
    ))
    .unwrap();
    let record = block_on(engine.create_entry(
        None,
        attrs(json!({
            "type": "record",
            "name": "Ship it",
            "parentId": "D1",
            "databaseId": "D1",
            "fields": {"status": "todo", "estimate": 3}
        })),
        Some("D1"),
    ))
    .unwrap()
    .unwrap();
    assert_eq!(record.root_id, "S1");

    let updated = block_on(engine.update_entry(&record.id, |current| {
        let mut next = current.clone();
        next["fields"]["status"] = json!("done");
        next
    }))
    .unwrap();
    assert_eq!(updated.attributes["fields"], json!({"status": "done", "estimate": 3}));
    assert_eq!(engine.list_entries_by_root("S1").unwrap().len(), 3);
}
