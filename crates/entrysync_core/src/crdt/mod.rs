//! CRDT layer for entry attributes.
//!
//! Every entry owns one [`CrdtDocument`]. Its state is never persisted as a
//! snapshot: the transaction log stores the incremental updates, and the
//! document is rebuilt by replaying them in log order whenever a write needs
//! to diff against it.
//!
//! [`SchemaRegistry`] decides how each attribute is represented in the
//! document, which in turn decides how concurrent edits merge.

mod document;
mod schema;

pub use document::CrdtDocument;
pub use schema::{AttributeSchema, FieldSchema, FieldType, SchemaRegistry};
