//! # Listener Port
//!
//! Observers of committed state updates. Listeners are registered on a
//! registry handed to the state manager at construction, so consumers are
//! explicit dependencies rather than process-global hooks.

use crate::events::StateUpdatePayload;
use std::sync::Arc;

/// Receives the full change set of a committed block. Called after the trie
/// commit succeeds and before the snapshot layer is updated.
pub trait StateUpdateListener: Send + Sync {
    fn on_state_update(&self, payload: &StateUpdatePayload);
}

/// Ordered set of listeners, notified in registration order.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn StateUpdateListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Arc<dyn StateUpdateListener>) {
        self.listeners.push(listener);
    }

    pub fn notify(&self, payload: &StateUpdatePayload) {
        for listener in &self.listeners {
            listener.on_state_update(payload);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
