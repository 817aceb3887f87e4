//! Named handler tables with priority-ordered fallback.
//!
//! [`DispatchTable`] keeps, per function name, entries ordered by priority
//! (descending) and then by registration sequence (ascending). The broker uses
//! it across all participants; each [`crate::Connection`] wraps one in a
//! [`HandlerRegistry`] for its local handlers.

use crate::handler::{same_handler, RpcHandler};
use crate::ipc::HandlerId;
use crate::{Error, Result};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Position of an entry in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchKey {
    pub priority: u16,
    pub seq: u64,
}

impl Ord for DispatchKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for DispatchKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct DispatchEntry<T> {
    pub key: DispatchKey,
    pub value: T,
}

/// Function name → entries in dispatch order.
#[derive(Debug)]
pub struct DispatchTable<T> {
    names: HashMap<String, Vec<DispatchEntry<T>>>,
    next_seq: u64,
}

impl<T> Default for DispatchTable<T> {
    fn default() -> Self {
        Self {
            names: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> DispatchTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. Equal priorities keep registration order.
    pub fn insert(&mut self, name: impl Into<String>, priority: u16, value: T) -> DispatchKey {
        let key = DispatchKey {
            priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let entries = self.names.entry(name.into()).or_default();
        let index = entries.partition_point(|entry| entry.key < key);
        entries.insert(index, DispatchEntry { key, value });
        key
    }

    /// Highest-priority entry for `name`.
    pub fn first(&self, name: &str) -> Option<&DispatchEntry<T>> {
        self.names.get(name).and_then(|entries| entries.first())
    }

    /// First entry strictly after `key` in dispatch order.
    ///
    /// Works from the key rather than an index, so entries added or removed
    /// since `key` was handed out neither get skipped nor called twice.
    pub fn next_after(&self, name: &str, key: DispatchKey) -> Option<&DispatchEntry<T>> {
        self.names
            .get(name)
            .and_then(|entries| entries.iter().find(|entry| entry.key > key))
    }

    pub fn entries(&self, name: &str) -> &[DispatchEntry<T>] {
        self.names.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn any(&self, name: &str, mut pred: impl FnMut(&T) -> bool) -> bool {
        self.entries(name).iter().any(|entry| pred(&entry.value))
    }

    /// Keep only entries for which `keep` returns true; drops emptied names.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &T) -> bool) {
        self.names.retain(|name, entries| {
            entries.retain(|entry| keep(name, &entry.value));
            !entries.is_empty()
        });
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }
}

/// Per-connection registry of local handlers.
///
/// Owned by the connection's I/O loop. Calls routed by the broker name the
/// [`HandlerId`] to run, so lookup is by id; the name table catches duplicate
/// registrations.
#[derive(Default)]
pub struct HandlerRegistry {
    table: DispatchTable<HandlerId>,
    handlers: HashMap<HandlerId, Arc<dyn RpcHandler>>,
    next_id: HandlerId,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler under `name`.
    ///
    /// Fails with [`Error::RpcDone`] if this exact handler instance is already
    /// registered under `name`. The same instance may serve other names.
    pub fn register(
        &mut self,
        name: &str,
        priority: u16,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<HandlerId> {
        let handlers = &self.handlers;
        let duplicate = self.table.any(name, |id| {
            handlers
                .get(id)
                .is_some_and(|existing| same_handler(existing, &handler))
        });
        if duplicate {
            return Err(Error::RpcDone);
        }

        self.next_id += 1;
        let id = self.next_id;
        self.table.insert(name, priority, id);
        self.handlers.insert(id, handler);
        Ok(id)
    }

    pub fn get(&self, id: HandlerId) -> Option<&Arc<dyn RpcHandler>> {
        self.handlers.get(&id)
    }

    pub fn remove(&mut self, id: HandlerId) -> Option<Arc<dyn RpcHandler>> {
        self.table.retain(|_, entry_id| *entry_id != id);
        self.handlers.remove(&id)
    }

    pub fn clear(&mut self) {
        self.table.clear();
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
