//! Pluggable capabilities the engine depends on.
//!
//! The engine never decides policy itself. It asks an [`Authorizer`] before
//! every local write, hands materialized attributes to a [`TextExtractor`]
//! to feed the search index, and pokes a [`SyncTrigger`] after every
//! committed local change.
//!
//! ## Object safety
//!
//! The traits are used behind `Arc<dyn ...>`, so async methods return
//! [`BoxFuture`]s.

use std::future::Future;
use std::pin::Pin;

use crate::types::{ActorContext, Attributes, Entry, EntryText};

/// A boxed future for object-safe async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Permission checks for local writes.
///
/// `root` is the root entry of the hierarchy the write targets. When
/// creating a root itself there is no root entry yet and `root` is `None`.
pub trait Authorizer: Send + Sync {
    /// May `actor` create an entry with `attributes`?
    fn can_create<'a>(
        &'a self,
        actor: &'a ActorContext,
        root: Option<&'a Entry>,
        attributes: &'a Attributes,
    ) -> BoxFuture<'a, bool>;

    /// May `actor` change `entry` so that it carries `attributes`?
    fn can_update<'a>(
        &'a self,
        actor: &'a ActorContext,
        root: &'a Entry,
        entry: &'a Entry,
        attributes: &'a Attributes,
    ) -> BoxFuture<'a, bool>;

    /// May `actor` delete `entry`?
    fn can_delete<'a>(
        &'a self,
        actor: &'a ActorContext,
        root: &'a Entry,
        entry: &'a Entry,
    ) -> BoxFuture<'a, bool>;
}

/// Authorizer that permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_create<'a>(
        &'a self,
        _actor: &'a ActorContext,
        _root: Option<&'a Entry>,
        _attributes: &'a Attributes,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }

    fn can_update<'a>(
        &'a self,
        _actor: &'a ActorContext,
        _root: &'a Entry,
        _entry: &'a Entry,
        _attributes: &'a Attributes,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }

    fn can_delete<'a>(
        &'a self,
        _actor: &'a ActorContext,
        _root: &'a Entry,
        _entry: &'a Entry,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }
}

/// Produces the search index row for an entry.
pub trait TextExtractor: Send + Sync {
    /// Extract the indexable text of an entry, or `None` if there is nothing
    /// to index.
    fn extract_text(&self, entry_id: &str, attributes: &Attributes) -> Option<EntryText>;
}

/// Indexes a name attribute and a list of text attributes.
#[derive(Debug, Clone)]
pub struct AttributeTextExtractor {
    /// Attribute used as the display name
    pub name_field: String,
    /// Attributes concatenated (newline separated) into the indexed text
    pub text_fields: Vec<String>,
}

impl Default for AttributeTextExtractor {
    fn default() -> Self {
        Self {
            name_field: "name".to_string(),
            text_fields: vec!["content".to_string()],
        }
    }
}

impl TextExtractor for AttributeTextExtractor {
    fn extract_text(&self, entry_id: &str, attributes: &Attributes) -> Option<EntryText> {
        let name = attributes
            .get(&self.name_field)
            .and_then(|v| v.as_str())
            .map(String::from);

        let parts: Vec<&str> = self
            .text_fields
            .iter()
            .filter_map(|field| attributes.get(field).and_then(|v| v.as_str()))
            .filter(|text| !text.is_empty())
            .collect();
        let text = (!parts.is_empty()).then(|| parts.join("\n"));

        if name.is_none() && text.is_none() {
            return None;
        }
        Some(EntryText {
            id: entry_id.to_string(),
            name,
            text,
        })
    }
}

/// Notified after every committed local change so pending mutations get
/// pushed soon.
pub trait SyncTrigger: Send + Sync {
    /// Request a sync. Must not block.
    fn trigger_sync(&self);
}

impl<F> SyncTrigger for F
where
    F: Fn() + Send + Sync,
{
    fn trigger_sync(&self) {
        self()
    }
}

/// Sync trigger that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSyncTrigger;

impl SyncTrigger for NoopSyncTrigger {
    fn trigger_sync(&self) {}
}
