//! entrysync server of record
//!
//! Owns the authoritative, append-only transaction log of a workspace. Every
//! committed transaction gets a version from a single workspace-global
//! counter, and clients pull everything above their cursor in version order.
//!
//! ## Features
//!
//! - **Commit validation**: duplicate submissions are idempotent, conflicting
//!   creates and writes to unknown or deleted entries are rejected
//! - **Pluggable policy**: a [`CommitPolicy`](policy::CommitPolicy) decides
//!   whether an actor may commit a transaction
//! - **Interaction versioning**: seen/opened marks share the version counter
//! - **In-process transport**: [`SyncServer`] implements the client-side
//!   `MutationTransport` and `TransactionSource` traits
//!
//! ## Environment Variables
//!
//! - `DATABASE_PATH`: Path to SQLite database (default: ./entrysync.db)
//! - `PULL_LIMIT`: Maximum items returned by one pull (default: 500)

pub mod config;
pub mod db;
pub mod error;
pub mod policy;
pub mod server;

pub use config::Config;
pub use error::ServerError;
pub use server::SyncServer;
