//! Entry change events and their subscription registry.
//!
//! The engine emits an [`EntryEvent`] after every committed change to the
//! local replica, whether it came from a local write, a pulled server
//! transaction or a revert. Subscribers register on the [`EventBus`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::types::{ActorContext, Entry, EntryInteraction};

/// Events emitted when the local replica changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryEvent {
    /// An entry appeared (local create, pulled create, reverted delete).
    EntryCreated {
        /// Account of the replica
        account_id: String,
        /// Workspace of the replica
        workspace_id: String,
        /// The new entry state
        entry: Entry,
    },

    /// An entry's attributes changed.
    EntryUpdated {
        /// Account of the replica
        account_id: String,
        /// Workspace of the replica
        workspace_id: String,
        /// The new entry state
        entry: Entry,
    },

    /// An entry disappeared.
    EntryDeleted {
        /// Account of the replica
        account_id: String,
        /// Workspace of the replica
        workspace_id: String,
        /// Last known state of the entry
        entry: Entry,
    },

    /// A collaborator's seen/opened state for an entry changed.
    EntryInteractionUpdated {
        /// Account of the replica
        account_id: String,
        /// Workspace of the replica
        workspace_id: String,
        /// The new interaction state
        interaction: EntryInteraction,
    },
}

impl EntryEvent {
    pub(crate) fn created(actor: &ActorContext, entry: Entry) -> Self {
        EntryEvent::EntryCreated {
            account_id: actor.account_id.clone(),
            workspace_id: actor.workspace_id.clone(),
            entry,
        }
    }

    pub(crate) fn updated(actor: &ActorContext, entry: Entry) -> Self {
        EntryEvent::EntryUpdated {
            account_id: actor.account_id.clone(),
            workspace_id: actor.workspace_id.clone(),
            entry,
        }
    }

    pub(crate) fn deleted(actor: &ActorContext, entry: Entry) -> Self {
        EntryEvent::EntryDeleted {
            account_id: actor.account_id.clone(),
            workspace_id: actor.workspace_id.clone(),
            entry,
        }
    }

    pub(crate) fn interaction_updated(actor: &ActorContext, interaction: EntryInteraction) -> Self {
        EntryEvent::EntryInteractionUpdated {
            account_id: actor.account_id.clone(),
            workspace_id: actor.workspace_id.clone(),
            interaction,
        }
    }

    /// Id of the entry the event is about.
    pub fn entry_id(&self) -> &str {
        match self {
            EntryEvent::EntryCreated { entry, .. }
            | EntryEvent::EntryUpdated { entry, .. }
            | EntryEvent::EntryDeleted { entry, .. } => &entry.id,
            EntryEvent::EntryInteractionUpdated { interaction, .. } => &interaction.entry_id,
        }
    }

    /// Event name as serialized in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            EntryEvent::EntryCreated { .. } => "entry_created",
            EntryEvent::EntryUpdated { .. } => "entry_updated",
            EntryEvent::EntryDeleted { .. } => "entry_deleted",
            EntryEvent::EntryInteractionUpdated { .. } => "entry_interaction_updated",
        }
    }
}

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback invoked for each event. Should not block.
pub type EventCallback = Arc<dyn Fn(&EntryEvent) + Send + Sync>;

/// Thread-safe registry of event subscribers.
pub struct EventBus {
    callbacks: RwLock<HashMap<SubscriptionId, EventCallback>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback. Returns an id for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, callback: EventCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        callbacks.insert(id, callback);
        id
    }

    /// Remove a callback. Returns `true` if it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        callbacks.remove(&id).is_some()
    }

    /// Deliver an event to every subscriber.
    ///
    /// A panicking subscriber does not prevent delivery to the others.
    pub fn emit(&self, event: &EntryEvent) {
        log::debug!("Emitting {} for entry {}", event.kind(), event.entry_id());
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        for callback in callbacks.values() {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event);
            }));
        }
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
