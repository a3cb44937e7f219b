//! CRDT document holding one entry's attributes.
//!
//! [`CrdtDocument`] wraps a yrs [`Doc`] with a single root map named
//! `"attributes"`:
//!
//! ```text
//! Y.Doc
//! └── Y.Map "attributes"
//!     ├── "type"    → "\"page\""          (JSON-encoded scalar)
//!     ├── "name"    → "\"Roadmap\""
//!     ├── "content" → Y.Text              (FieldType::Text)
//!     └── "fields"  → Y.Map { ... }       (FieldType::Object / Record)
//! ```
//!
//! Scalars are stored JSON-encoded so every JSON value round-trips exactly,
//! which keeps materialization deterministic across replays.

use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn, Text, TextPrelim, TextRef, Transact,
    TransactionMut, Update,
};

use super::schema::{AttributeSchema, FieldType};
use crate::error::{Result, SyncError};
use crate::types::Attributes;

/// The name of the Y.Map containing the entry attributes.
const ATTRIBUTES_MAP_NAME: &str = "attributes";

/// A CRDT document for a single entry.
pub struct CrdtDocument {
    doc: Doc,
    attributes: MapRef,
}

impl CrdtDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        let doc = Doc::new();
        let attributes = doc.get_or_insert_map(ATTRIBUTES_MAP_NAME);
        Self { doc, attributes }
    }

    /// Build a document by applying `updates` in order.
    pub fn replay<'a, I>(updates: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let document = Self::new();
        for update in updates {
            document.apply_update(update)?;
        }
        Ok(document)
    }

    /// Apply a binary update. Applying the same update twice is a no-op.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| SyncError::Crdt(format!("Failed to decode update: {}", e)))?;

        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| SyncError::Crdt(format!("Failed to apply update: {}", e)))?;
        Ok(())
    }

    /// Bring the document to `candidate` and return the incremental update.
    ///
    /// The candidate is validated against `schema` first. Only the attributes
    /// that differ are touched; text attributes are edited with a minimal
    /// splice so concurrent edits elsewhere in the text survive the merge.
    /// Returns `None` when the document already matches the candidate.
    pub fn diff_attributes(
        &self,
        schema: &AttributeSchema,
        candidate: &Attributes,
    ) -> Result<Option<Vec<u8>>> {
        schema.validate(candidate)?;

        let mut txn = self.doc.transact_mut();
        if !apply_object(&mut txn, &self.attributes, schema, candidate)? {
            return Ok(None);
        }

        // Only this transaction's blocks and deletions, so the update does
        // not re-delete items removed by earlier transactions
        Ok(Some(txn.encode_update_v1()))
    }

    /// Read back the attributes as JSON.
    pub fn materialize(&self) -> Attributes {
        let txn = self.doc.transact();
        read_map(&txn, &self.attributes)
    }

    /// Encode the full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&Default::default())
    }
}

impl Default for CrdtDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CrdtDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtDocument")
            .field("attributes", &self.materialize())
            .finish_non_exhaustive()
    }
}

fn present<'a>(attributes: &'a Attributes, key: &str) -> Option<&'a Value> {
    attributes.get(key).filter(|v| !v.is_null())
}

fn remove_stale_keys(
    txn: &mut TransactionMut,
    map: &MapRef,
    keep: impl Fn(&str) -> bool,
) -> bool {
    let stale: Vec<String> = map
        .keys(&*txn)
        .filter(|key| !keep(key))
        .map(String::from)
        .collect();

    for key in &stale {
        map.remove(txn, key);
    }
    !stale.is_empty()
}

fn apply_object(
    txn: &mut TransactionMut,
    map: &MapRef,
    schema: &AttributeSchema,
    candidate: &Attributes,
) -> Result<bool> {
    let mut changed = remove_stale_keys(txn, map, |key| {
        schema.field(key).is_some() && present(candidate, key).is_some()
    });

    for (name, field) in schema.fields() {
        if let Some(value) = present(candidate, name) {
            changed |= apply_field(txn, map, name, &field.field_type, value)?;
        }
    }
    Ok(changed)
}

fn apply_record(
    txn: &mut TransactionMut,
    map: &MapRef,
    item_type: &FieldType,
    candidate: &Attributes,
) -> Result<bool> {
    let mut changed = remove_stale_keys(txn, map, |key| present(candidate, key).is_some());

    for (key, value) in candidate {
        if !value.is_null() {
            changed |= apply_field(txn, map, key, item_type, value)?;
        }
    }
    Ok(changed)
}

fn apply_field(
    txn: &mut TransactionMut,
    map: &MapRef,
    key: &str,
    field_type: &FieldType,
    value: &Value,
) -> Result<bool> {
    match field_type {
        FieldType::Text => {
            let target = value.as_str().unwrap_or_default();
            match map.get(&*txn, key) {
                Some(Out::YText(text)) => Ok(splice_text(txn, &text, target)),
                _ => {
                    map.insert(txn, key, TextPrelim::new(target));
                    Ok(true)
                }
            }
        }
        FieldType::Object(schema) => {
            let (nested, created) = nested_map(txn, map, key);
            let object = as_object(key, value)?;
            Ok(apply_object(txn, &nested, schema, object)? || created)
        }
        FieldType::Record(item_type) => {
            let (nested, created) = nested_map(txn, map, key);
            let object = as_object(key, value)?;
            Ok(apply_record(txn, &nested, item_type, object)? || created)
        }
        FieldType::String | FieldType::Number | FieldType::Boolean | FieldType::Json => {
            let encoded = serde_json::to_string(value)?;
            let current = match map.get(&*txn, key) {
                Some(out @ Out::Any(_)) => Some(out.to_string(&*txn)),
                _ => None,
            };
            if current.as_deref() == Some(encoded.as_str()) {
                return Ok(false);
            }
            map.insert(txn, key, encoded);
            Ok(true)
        }
    }
}

fn as_object<'a>(key: &str, value: &'a Value) -> Result<&'a Attributes> {
    value
        .as_object()
        .ok_or_else(|| SyncError::InvalidAttributes(format!("'{}' must be an object", key)))
}

/// Get the nested map stored under `key`, creating it if absent.
fn nested_map(txn: &mut TransactionMut, map: &MapRef, key: &str) -> (MapRef, bool) {
    match map.get(&*txn, key) {
        Some(Out::YMap(nested)) => (nested, false),
        _ => (map.insert(txn, key, MapPrelim::default()), true),
    }
}

/// Replace the content of `text` with `target` using a single splice
/// covering only the part between the common prefix and suffix.
fn splice_text(txn: &mut TransactionMut, text: &TextRef, target: &str) -> bool {
    let current = text.get_string(&*txn);
    if current == target {
        return false;
    }

    let prefix: usize = current
        .chars()
        .zip(target.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();
    let suffix: usize = current[prefix..]
        .chars()
        .rev()
        .zip(target[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();

    // yrs offsets are UTF-8 byte offsets with the default document options
    let remove_len = current.len() - prefix - suffix;
    if remove_len > 0 {
        text.remove_range(txn, prefix as u32, remove_len as u32);
    }

    let insert = &target[prefix..target.len() - suffix];
    if !insert.is_empty() {
        text.insert(txn, prefix as u32, insert);
    }
    true
}

fn read_map<T: ReadTxn>(txn: &T, map: &MapRef) -> Attributes {
    map.iter(txn)
        .map(|(key, value)| (key.to_string(), read_value(txn, value)))
        .collect()
}

fn read_value<T: ReadTxn>(txn: &T, value: Out) -> Value {
    match value {
        Out::YText(text) => Value::String(text.get_string(txn)),
        Out::YMap(map) => Value::Object(read_map(txn, &map)),
        other => {
            let raw = other.to_string(txn);
            serde_json::from_str(&raw).unwrap_or(Value::String(raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::SchemaRegistry;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    fn page_schema() -> AttributeSchema {
        SchemaRegistry::with_defaults().get("page").unwrap().clone()
    }

    #[test]
    fn test_diff_and_materialize() {
        let doc = CrdtDocument::new();
        let candidate = attrs(json!({"type": "page", "name": "A", "content": "hello"}));

        let update = doc.diff_attributes(&page_schema(), &candidate).unwrap();
        assert!(update.is_some());
        assert_eq!(doc.materialize(), candidate);
    }

    #[test]
    fn test_unchanged_candidate_yields_no_update() {
        let doc = CrdtDocument::new();
        let candidate = attrs(json!({"type": "page", "name": "A"}));
        doc.diff_attributes(&page_schema(), &candidate).unwrap();

        let again = doc.diff_attributes(&page_schema(), &candidate).unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_invalid_candidate_leaves_document_untouched() {
        let doc = CrdtDocument::new();
        let bad = attrs(json!({"type": "page", "name": 7}));
        assert!(matches!(
            doc.diff_attributes(&page_schema(), &bad),
            Err(SyncError::InvalidAttributes(_))
        ));
        assert!(doc.materialize().is_empty());
    }

    #[test]
    fn test_replay_reproduces_state() {
        let doc = CrdtDocument::new();
        let schema = page_schema();
        let first = doc
            .diff_attributes(&schema, &attrs(json!({"type": "page", "name": "A"})))
            .unwrap()
            .unwrap();
        let second = doc
            .diff_attributes(
                &schema,
                &attrs(json!({"type": "page", "name": "B", "content": "body"})),
            )
            .unwrap()
            .unwrap();

        let replayed = CrdtDocument::replay([first.as_slice(), second.as_slice()]).unwrap();
        assert_eq!(replayed.materialize(), doc.materialize());

        // Order independent and idempotent
        let shuffled =
            CrdtDocument::replay([second.as_slice(), first.as_slice(), second.as_slice()]).unwrap();
        assert_eq!(shuffled.materialize(), doc.materialize());
    }

    #[test]
    fn test_update_excludes_earlier_deletions() {
        let doc = CrdtDocument::new();
        let schema = page_schema();
        let t1 = doc
            .diff_attributes(&schema, &attrs(json!({"type": "page", "name": "A"})))
            .unwrap()
            .unwrap();
        let t2 = doc
            .diff_attributes(&schema, &attrs(json!({"type": "page", "name": "B"})))
            .unwrap()
            .unwrap();
        let t3 = doc
            .diff_attributes(
                &schema,
                &attrs(json!({"type": "page", "name": "B", "content": "body"})),
            )
            .unwrap()
            .unwrap();

        let without_t2 = CrdtDocument::replay([t1.as_slice(), t3.as_slice()]).unwrap();
        assert_eq!(
            without_t2.materialize(),
            attrs(json!({"type": "page", "name": "A", "content": "body"}))
        );

        let full = CrdtDocument::replay([t1.as_slice(), t2.as_slice(), t3.as_slice()]).unwrap();
        assert_eq!(full.materialize(), doc.materialize());
    }

    #[test]
    fn test_removed_attribute_is_deleted() {
        let doc = CrdtDocument::new();
        let schema = page_schema();
        doc.diff_attributes(
            &schema,
            &attrs(json!({"type": "page", "name": "A", "parentId": "p1"})),
        )
        .unwrap();

        let update = doc
            .diff_attributes(&schema, &attrs(json!({"type": "page", "name": "A"})))
            .unwrap();
        assert!(update.is_some());
        assert_eq!(doc.materialize(), attrs(json!({"type": "page", "name": "A"})));
    }

    #[test]
    fn test_concurrent_text_edits_merge() {
        let schema = page_schema();
        let base = CrdtDocument::new();
        let create = base
            .diff_attributes(
                &schema,
                &attrs(json!({"type": "page", "name": "A", "content": "hello world"})),
            )
            .unwrap()
            .unwrap();

        let left = CrdtDocument::replay([create.as_slice()]).unwrap();
        let right = CrdtDocument::replay([create.as_slice()]).unwrap();

        let left_update = left
            .diff_attributes(
                &schema,
                &attrs(json!({"type": "page", "name": "A", "content": "hello brave world"})),
            )
            .unwrap()
            .unwrap();
        let right_update = right
            .diff_attributes(
                &schema,
                &attrs(json!({"type": "page", "name": "A", "content": "hello world!"})),
            )
            .unwrap()
            .unwrap();

        left.apply_update(&right_update).unwrap();
        right.apply_update(&left_update).unwrap();

        assert_eq!(left.materialize(), right.materialize());
        assert_eq!(left.materialize()["content"], "hello brave world!");
    }

    #[test]
    fn test_nested_record_fields() {
        let registry = SchemaRegistry::with_defaults();
        let schema = registry.get("record").unwrap();
        let doc = CrdtDocument::new();

        let mut candidate = attrs(json!({
            "type": "record",
            "name": "Row",
            "parentId": "db1",
            "databaseId": "db1",
            "fields": {"status": "open", "points": 3}
        }));
        doc.diff_attributes(schema, &candidate).unwrap();
        assert_eq!(doc.materialize(), candidate);

        candidate["fields"] = json!({"status": "done"});
        doc.diff_attributes(schema, &candidate).unwrap().unwrap();
        assert_eq!(doc.materialize()["fields"], json!({"status": "done"}));
    }

    #[test]
    fn test_scalar_values_round_trip_exactly() {
        let schema = AttributeSchema::new()
            .required("type", FieldType::String)
            .optional("weight", FieldType::Number)
            .optional("done", FieldType::Boolean)
            .optional("meta", FieldType::Json);
        let doc = CrdtDocument::new();
        let candidate = attrs(json!({
            "type": "task",
            "weight": 1.5,
            "done": false,
            "meta": {"tags": ["a", "b"], "n": null}
        }));
        doc.diff_attributes(&schema, &candidate).unwrap();
        assert_eq!(doc.materialize(), candidate);
    }
}
