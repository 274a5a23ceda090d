//! Member sets for the two group strategies.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::server::{ConnectionId, HubConnection};

/// How a group stores its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupStrategy {
    /// A concurrent map: O(1) join and leave, broadcast iterates live shards.
    #[default]
    ConcurrentMap,
    /// An immutable snapshot swapped on every join and leave; broadcast
    /// iterates a snapshot without holding any lock.
    CopyOnWrite,
}

pub(crate) enum Members {
    Concurrent(DashMap<ConnectionId, Arc<HubConnection>>),
    CopyOnWrite(ArcSwap<Vec<Arc<HubConnection>>>),
}

impl Members {
    pub(crate) fn new(strategy: GroupStrategy) -> Self {
        match strategy {
            GroupStrategy::ConcurrentMap => Self::Concurrent(DashMap::new()),
            GroupStrategy::CopyOnWrite => Self::CopyOnWrite(ArcSwap::from_pointee(Vec::new())),
        }
    }

    /// Returns false if the connection was already a member.
    pub(crate) fn insert(&self, connection: Arc<HubConnection>) -> bool {
        match self {
            Self::Concurrent(map) => map.insert(connection.id(), connection).is_none(),
            Self::CopyOnWrite(snapshot) => {
                let id = connection.id();
                let mut added = false;
                snapshot.rcu(|current| {
                    if current.iter().any(|c| c.id() == id) {
                        added = false;
                        return Arc::clone(current);
                    }
                    added = true;
                    let mut next = Vec::with_capacity(current.len() + 1);
                    next.extend(current.iter().cloned());
                    next.push(connection.clone());
                    Arc::new(next)
                });
                added
            }
        }
    }

    pub(crate) fn remove(&self, id: ConnectionId) -> bool {
        match self {
            Self::Concurrent(map) => map.remove(&id).is_some(),
            Self::CopyOnWrite(snapshot) => {
                let mut removed = false;
                snapshot.rcu(|current| {
                    removed = current.iter().any(|c| c.id() == id);
                    if !removed {
                        return Arc::clone(current);
                    }
                    Arc::new(current.iter().filter(|c| c.id() != id).cloned().collect())
                });
                removed
            }
        }
    }

    pub(crate) fn contains(&self, id: ConnectionId) -> bool {
        match self {
            Self::Concurrent(map) => map.contains_key(&id),
            Self::CopyOnWrite(snapshot) => snapshot.load().iter().any(|c| c.id() == id),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Concurrent(map) => map.len(),
            Self::CopyOnWrite(snapshot) => snapshot.load().len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Members accepted by `keep`, cloned out so no lock is held during I/O.
    pub(crate) fn select(
        &self,
        mut keep: impl FnMut(ConnectionId) -> bool,
    ) -> Vec<Arc<HubConnection>> {
        match self {
            Self::Concurrent(map) => map
                .iter()
                .filter(|e| keep(*e.key()))
                .map(|e| e.value().clone())
                .collect(),
            Self::CopyOnWrite(snapshot) => snapshot
                .load()
                .iter()
                .filter(|c| keep(c.id()))
                .cloned()
                .collect(),
        }
    }
}
