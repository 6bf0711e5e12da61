//! In-process event bus.
//!
//! The bus only stores which functions are bound to which event name; actual
//! dispatch goes through the runtime so every delivery runs under the
//! execution harness. Bindings for an event are replaced wholesale on reload,
//! which keeps repeated reloads from multiplying deliveries.

use std::collections::HashMap;
use std::sync::RwLock;

/// One function bound to an event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBinding {
    pub function: String,
}

#[derive(Debug, Default)]
pub struct EventBus {
    bindings: RwLock<HashMap<String, Vec<EventBinding>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the full binding table. Readers see either the old table or
    /// the new one, never a mix.
    pub fn rebuild(&self, table: HashMap<String, Vec<EventBinding>>) {
        *self.bindings.write().expect("event bus lock poisoned") = table;
    }

    /// Replace the bindings for a single event name.
    pub fn rebind(&self, event: &str, bindings: Vec<EventBinding>) {
        let mut table = self.bindings.write().expect("event bus lock poisoned");
        if bindings.is_empty() {
            table.remove(event);
        } else {
            table.insert(event.to_string(), bindings);
        }
    }

    /// Bindings for an event, in registration order.
    pub fn bindings(&self, event: &str) -> Vec<EventBinding> {
        self.bindings
            .read()
            .expect("event bus lock poisoned")
            .get(event)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_listeners(&self, event: &str) -> bool {
        !self.bindings(event).is_empty()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.bindings(event).len()
    }
}
