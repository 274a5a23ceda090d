use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

use crate::server::ConnectionId;

/// Per-member values kept alongside a group.
///
/// An entry lives as long as its member: leaving the group drops it.
#[derive(Debug)]
pub struct InMemoryStorage<T> {
    values: DashMap<ConnectionId, T>,
}

impl<T> Default for InMemoryStorage<T> {
    fn default() -> Self {
        Self {
            values: DashMap::new(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> InMemoryStorage<T> {
    pub fn set(&self, id: ConnectionId, value: T) {
        self.values.insert(id, value);
    }

    pub fn get(&self, id: ConnectionId) -> Option<T> {
        self.values.get(&id).map(|v| v.value().clone())
    }

    pub fn remove(&self, id: ConnectionId) -> Option<T> {
        self.values.remove(&id).map(|(_, v)| v)
    }

    pub fn all(&self) -> Vec<T> {
        self.values.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Type-erased view a group uses to drop a departing member's entry.
pub(crate) trait StorageSlot: Send + Sync {
    fn remove_member(&self, id: ConnectionId);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Clone + Send + Sync + 'static> StorageSlot for InMemoryStorage<T> {
    fn remove_member(&self, id: ConnectionId) {
        self.values.remove(&id);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
