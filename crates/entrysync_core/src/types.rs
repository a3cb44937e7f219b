//! Core types shared by the stores, the engine and the transports.
//!
//! Everything that crosses the wire (transactions, mutations, interactions)
//! is `Serialize`/`Deserialize`. Binary CRDT payloads are base64 encoded in
//! their serialized form.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Materialized entry attributes (a JSON object).
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Attribute holding the entry type name used for schema lookup.
pub const TYPE_ATTRIBUTE: &str = "type";

static LAST_ID: Mutex<u128> = Mutex::new(0);

/// Generate a time-sortable identifier.
///
/// Ids are UUIDv7 strings. Within a process they are strictly increasing, so
/// sorting ids lexically yields creation order even for ids generated in the
/// same millisecond.
pub fn generate_id() -> String {
    let candidate = Uuid::now_v7().as_u128();
    let mut last = LAST_ID.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let next = if candidate > *last {
        candidate
    } else {
        *last + 1
    };
    *last = next;
    Uuid::from_u128(next).to_string()
}

/// Current time truncated to millisecond precision (the storage resolution).
pub fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

pub(crate) fn to_millis(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Identity of the local actor performing writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    /// Account the replica belongs to
    pub account_id: String,
    /// Workspace the replica mirrors
    pub workspace_id: String,
    /// Collaborator id recorded as `created_by` / `updated_by`
    pub user_id: String,
}

impl ActorContext {
    /// Create a new actor context.
    pub fn new(
        account_id: impl Into<String>,
        workspace_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            workspace_id: workspace_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Materialized current state of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry id
    pub id: String,
    /// Id of the hierarchy root (equal to `id` for roots)
    pub root_id: String,
    /// Attributes materialized from the transaction log
    pub attributes: Attributes,
    /// Creation time of the create transaction
    pub created_at: DateTime<Utc>,
    /// Creator of the entry
    pub created_by: String,
    /// Time of the last applied update
    pub updated_at: Option<DateTime<Utc>>,
    /// Author of the last applied update
    pub updated_by: Option<String>,
    /// Id of the last transaction applied to `attributes` (CAS token)
    pub transaction_id: String,
}

impl Entry {
    /// The entry type, read from the `type` attribute.
    pub fn entry_type(&self) -> Option<&str> {
        self.attributes.get(TYPE_ATTRIBUTE).and_then(|v| v.as_str())
    }

    /// Whether this entry is the root of its hierarchy.
    pub fn is_root(&self) -> bool {
        self.id == self.root_id
    }
}

/// Kind of change carried by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// First transaction of an entry
    Create,
    /// Incremental attribute change
    Update,
    /// Terminal tombstone
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(format!("Unknown transaction operation: {}", s)),
        }
    }
}

/// One durable, ordered change to an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryTransaction {
    /// Time-sortable transaction id
    pub id: String,
    /// Entry the transaction applies to
    pub entry_id: String,
    /// Root of the entry
    pub root_id: String,
    /// Create, update or delete
    pub operation: Operation,
    /// Binary CRDT update; `None` only for deletes
    #[serde(default, with = "base64_bytes")]
    pub data: Option<Vec<u8>>,
    /// Client-side creation time
    pub created_at: DateTime<Utc>,
    /// Author
    pub created_by: String,
    /// Workspace-global server version, 0 until the server assigns it
    #[serde(default)]
    pub version: i64,
    /// Server commit time, set together with `version`
    #[serde(default)]
    pub server_created_at: Option<DateTime<Utc>>,
}

impl EntryTransaction {
    /// Whether the server of record has stamped this transaction.
    pub fn is_synced(&self) -> bool {
        self.server_created_at.is_some()
    }

    /// Whether `other` carries the same server stamp as `self`.
    pub fn same_server_stamp(&self, other: &EntryTransaction) -> bool {
        self.version == other.version
            && self.server_created_at.as_ref().map(to_millis)
                == other.server_created_at.as_ref().map(to_millis)
    }

    /// The CRDT update carried by a create or update transaction.
    pub fn update_data(&self) -> Result<&[u8]> {
        self.data.as_deref().ok_or_else(|| {
            SyncError::Crdt(format!(
                "{} transaction {} carries no update",
                self.operation, self.id
            ))
        })
    }
}

/// Kind of outbox mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationType {
    /// Wraps a create transaction
    ApplyCreateTransaction,
    /// Wraps an update transaction
    ApplyUpdateTransaction,
    /// Wraps a delete transaction
    ApplyDeleteTransaction,
    /// Records that the actor saw an entry
    MarkEntrySeen,
    /// Records that the actor opened an entry
    MarkEntryOpened,
}

impl MutationType {
    /// The mutation type wrapping a transaction with the given operation.
    pub fn for_operation(operation: Operation) -> Self {
        match operation {
            Operation::Create => MutationType::ApplyCreateTransaction,
            Operation::Update => MutationType::ApplyUpdateTransaction,
            Operation::Delete => MutationType::ApplyDeleteTransaction,
        }
    }

    /// Whether the payload is a serialized [`EntryTransaction`].
    pub fn carries_transaction(&self) -> bool {
        matches!(
            self,
            MutationType::ApplyCreateTransaction
                | MutationType::ApplyUpdateTransaction
                | MutationType::ApplyDeleteTransaction
        )
    }
}

impl std::fmt::Display for MutationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MutationType::ApplyCreateTransaction => "apply_create_transaction",
            MutationType::ApplyUpdateTransaction => "apply_update_transaction",
            MutationType::ApplyDeleteTransaction => "apply_delete_transaction",
            MutationType::MarkEntrySeen => "mark_entry_seen",
            MutationType::MarkEntryOpened => "mark_entry_opened",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for MutationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "apply_create_transaction" => Ok(MutationType::ApplyCreateTransaction),
            "apply_update_transaction" => Ok(MutationType::ApplyUpdateTransaction),
            "apply_delete_transaction" => Ok(MutationType::ApplyDeleteTransaction),
            "mark_entry_seen" => Ok(MutationType::MarkEntrySeen),
            "mark_entry_opened" => Ok(MutationType::MarkEntryOpened),
            _ => Err(format!("Unknown mutation type: {}", s)),
        }
    }
}

/// Payload of `mark_entry_seen` / `mark_entry_opened` mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionMark {
    /// Entry that was seen or opened
    pub entry_id: String,
    /// Root of the entry
    pub root_id: String,
    /// Collaborator performing the interaction
    pub collaborator_id: String,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// A pending operation destined for the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Mutation id
    pub id: String,
    /// What the payload is
    pub mutation_type: MutationType,
    /// Serialized payload (JSON)
    pub data: String,
    /// Enqueue time
    pub created_at: DateTime<Utc>,
    /// Number of transient push failures so far
    pub retries: u32,
}

impl Mutation {
    /// Wrap a transaction in a new mutation.
    pub fn for_transaction(transaction: &EntryTransaction) -> Result<Self> {
        Ok(Self {
            id: generate_id(),
            mutation_type: MutationType::for_operation(transaction.operation),
            data: serde_json::to_string(transaction)?,
            created_at: now(),
            retries: 0,
        })
    }

    /// Wrap an interaction mark in a new mutation.
    pub fn for_interaction(mutation_type: MutationType, mark: &InteractionMark) -> Result<Self> {
        Ok(Self {
            id: generate_id(),
            mutation_type,
            data: serde_json::to_string(mark)?,
            created_at: now(),
            retries: 0,
        })
    }

    /// Decode the wrapped transaction.
    pub fn transaction(&self) -> Result<EntryTransaction> {
        if !self.mutation_type.carries_transaction() {
            return Err(SyncError::Failed(format!(
                "mutation {} of type {} does not carry a transaction",
                self.id, self.mutation_type
            )));
        }
        Ok(serde_json::from_str(&self.data)?)
    }

    /// Decode the wrapped interaction mark.
    pub fn interaction(&self) -> Result<InteractionMark> {
        if self.mutation_type.carries_transaction() {
            return Err(SyncError::Failed(format!(
                "mutation {} of type {} does not carry an interaction",
                self.id, self.mutation_type
            )));
        }
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Per-collaborator seen/opened state of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryInteraction {
    /// Entry id
    pub entry_id: String,
    /// Collaborator id
    pub collaborator_id: String,
    /// Root of the entry
    pub root_id: String,
    /// First time the entry was seen
    pub first_seen_at: Option<DateTime<Utc>>,
    /// Last time the entry was seen
    pub last_seen_at: Option<DateTime<Utc>>,
    /// First time the entry was opened
    pub first_opened_at: Option<DateTime<Utc>>,
    /// Last time the entry was opened
    pub last_opened_at: Option<DateTime<Utc>>,
    /// Server-assigned version (0 for never-synced local state)
    pub version: i64,
}

impl EntryInteraction {
    /// An interaction with no recorded activity.
    pub fn empty(entry_id: &str, collaborator_id: &str, root_id: &str) -> Self {
        Self {
            entry_id: entry_id.to_string(),
            collaborator_id: collaborator_id.to_string(),
            root_id: root_id.to_string(),
            first_seen_at: None,
            last_seen_at: None,
            first_opened_at: None,
            last_opened_at: None,
            version: 0,
        }
    }

    /// Record a "seen" at `at`; the first timestamp is only set once.
    pub fn mark_seen(&mut self, at: DateTime<Utc>) {
        self.first_seen_at.get_or_insert(at);
        self.last_seen_at = Some(at);
    }

    /// Record an "opened" at `at`. Opening implies seeing.
    pub fn mark_opened(&mut self, at: DateTime<Utc>) {
        self.first_opened_at.get_or_insert(at);
        self.last_opened_at = Some(at);
        self.mark_seen(at);
    }
}

/// Row of the text side index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryText {
    /// Entry id
    pub id: String,
    /// Display name, if any
    pub name: Option<String>,
    /// Extracted body text, if any
    pub text: Option<String>,
}

/// Serde adapter encoding optional byte payloads as base64 strings.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(D::Error::custom))
            .transpose()
    }
}
