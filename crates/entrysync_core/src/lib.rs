#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Pluggable authorization, text extraction and sync triggering
pub mod capabilities;

/// Configuration options
pub mod config;

/// CRDT documents and attribute schemas
pub mod crdt;

/// Entry synchronization engine (local writes, server apply, reverts)
pub mod engine;

/// Error (common error types)
pub mod error;

/// Entry change events
pub mod events;

/// SQLite replica store
pub mod store;

/// Outbox push and server pull
pub mod sync;

/// Entries, transactions, mutations and interactions
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use engine::EntrySyncEngine;
pub use error::{Result, SyncError};
