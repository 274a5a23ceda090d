//! Named broadcast groups.
//!
//! A [`GroupRepository`] owns every [`Group`] of a hub. Groups are created on
//! first reference and dropped from the repository when their last member
//! leaves.
//!
//! Broadcasts encode the message once, then write the same bytes to every
//! selected member concurrently. Each write goes through the member's own
//! connection lock. A failed write is logged and skipped; it never fails the
//! broadcast or delays the other members.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use streamhub_core::{
    BufferPool, EncodeError, FrameHead, MessagePackSerializer, MethodId, PayloadSerializer,
};

use crate::server::{ConnectionId, HubConnection};

mod members;
mod storage;

pub use members::GroupStrategy;
use members::Members;
pub use storage::InMemoryStorage;
use storage::StorageSlot;

pub struct GroupRepository<S = MessagePackSerializer> {
    inner: Arc<RepositoryInner<S>>,
}

struct RepositoryInner<S> {
    groups: DashMap<String, Arc<Group<S>>>,
    strategy: GroupStrategy,
    buffer_pool: BufferPool,
}

impl<S> Clone for GroupRepository<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> fmt::Debug for GroupRepository<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupRepository")
            .field("strategy", &self.inner.strategy)
            .field("groups", &self.inner.groups.len())
            .finish()
    }
}

impl<S: PayloadSerializer> Default for GroupRepository<S> {
    fn default() -> Self {
        Self::new(GroupStrategy::default())
    }
}

impl<S: PayloadSerializer> GroupRepository<S> {
    pub fn new(strategy: GroupStrategy) -> Self {
        Self {
            inner: Arc::new(RepositoryInner {
                groups: DashMap::new(),
                strategy,
                buffer_pool: BufferPool::new(),
            }),
        }
    }

    pub fn strategy(&self) -> GroupStrategy {
        self.inner.strategy
    }

    /// The group called `name`, created empty if it does not exist.
    pub fn get_or_add(&self, name: &str) -> Arc<Group<S>> {
        if let Some(group) = self.inner.groups.get(name) {
            return group.value().clone();
        }
        self.inner
            .groups
            .entry(name.to_owned())
            .or_insert_with(|| self.new_group(name))
            .value()
            .clone()
    }

    pub fn try_get(&self, name: &str) -> Option<Arc<Group<S>>> {
        self.inner.groups.get(name).map(|g| g.value().clone())
    }

    /// Drop a group regardless of its members.
    pub fn remove(&self, name: &str) -> bool {
        self.inner.groups.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.groups.is_empty()
    }

    fn new_group(&self, name: &str) -> Arc<Group<S>> {
        let repository = Arc::downgrade(&self.inner);
        let strategy = self.inner.strategy;
        let buffer_pool = self.inner.buffer_pool.clone();
        Arc::new_cyclic(|this| Group {
            name: name.to_owned(),
            members: Members::new(strategy),
            storage: OnceLock::new(),
            buffer_pool,
            repository,
            this: this.clone(),
            _serializer: PhantomData,
        })
    }
}

/// A named set of connections that can be broadcast to.
pub struct Group<S = MessagePackSerializer> {
    name: String,
    members: Members,
    storage: OnceLock<Arc<dyn StorageSlot>>,
    buffer_pool: BufferPool,
    repository: Weak<RepositoryInner<S>>,
    this: Weak<Group<S>>,
    _serializer: PhantomData<fn() -> S>,
}

impl<S> fmt::Debug for Group<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("members", &self.members.len())
            .finish()
    }
}

impl<S: PayloadSerializer> Group<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a member. Returns false if it was already present.
    pub fn add(&self, connection: Arc<HubConnection>) -> bool {
        let id = connection.id();
        let added = match (self.repository.upgrade(), self.this.upgrade()) {
            (Some(repository), Some(this)) => {
                // Holding the entry keeps a concurrent last-member removal
                // from dropping the group between re-registration and insert.
                let _slot = repository
                    .groups
                    .entry(self.name.clone())
                    .or_insert(this);
                self.members.insert(connection)
            }
            _ => self.members.insert(connection),
        };
        if added {
            tracing::debug!(group = %self.name, connection_id = %id, "group: member joined");
        }
        added
    }

    /// Remove a member and its stored value. The group leaves the repository
    /// when this was the last member.
    pub fn remove(&self, id: ConnectionId) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        if let Some(storage) = self.storage.get() {
            storage.remove_member(id);
        }
        tracing::debug!(group = %self.name, connection_id = %id, "group: member left");

        if self.members.is_empty() {
            if let Some(repository) = self.repository.upgrade() {
                let dropped = repository.groups.remove_if(&self.name, |_, group| {
                    std::ptr::eq(Arc::as_ptr(group), self) && group.members.is_empty()
                });
                if dropped.is_some() {
                    tracing::debug!(group = %self.name, "group: removed after last member left");
                }
            }
        }
        true
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.contains(id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Per-member storage of `T`. Returns `None` if this group already holds
    /// storage of a different type.
    pub fn in_memory_storage<T: Clone + Send + Sync + 'static>(
        &self,
    ) -> Option<Arc<InMemoryStorage<T>>> {
        let slot = self
            .storage
            .get_or_init(|| Arc::new(InMemoryStorage::<T>::default()) as Arc<dyn StorageSlot>);
        let any: Arc<dyn Any + Send + Sync> = slot.clone().into_any();
        any.downcast::<InMemoryStorage<T>>().ok()
    }

    /// Broadcast to every member. Returns how many writes succeeded.
    pub async fn write_all<T: Serialize + ?Sized>(
        &self,
        method_id: MethodId,
        value: &T,
    ) -> Result<usize, EncodeError> {
        let frame = self.encode(method_id, value)?;
        Ok(self.write_raw(frame, &[]).await)
    }

    /// Broadcast to every member except `excluded`.
    pub async fn write_except<T: Serialize + ?Sized>(
        &self,
        method_id: MethodId,
        value: &T,
        excluded: &[ConnectionId],
    ) -> Result<usize, EncodeError> {
        let frame = self.encode(method_id, value)?;
        Ok(self.write_raw(frame, excluded).await)
    }

    /// Send to the members listed in `targets`; non-members are ignored.
    pub async fn write_to<T: Serialize + ?Sized>(
        &self,
        method_id: MethodId,
        value: &T,
        targets: &[ConnectionId],
    ) -> Result<usize, EncodeError> {
        self.write_to_except(method_id, value, targets, &[]).await
    }

    pub async fn write_to_except<T: Serialize + ?Sized>(
        &self,
        method_id: MethodId,
        value: &T,
        targets: &[ConnectionId],
        excluded: &[ConnectionId],
    ) -> Result<usize, EncodeError> {
        let frame = self.encode(method_id, value)?;
        let recipients = self
            .members
            .select(|id| targets.contains(&id) && !excluded.contains(&id));
        Ok(deliver(&self.name, recipients, frame).await)
    }

    /// Relay an already encoded message to every member except `excluded`.
    pub async fn write_raw(&self, frame: Bytes, excluded: &[ConnectionId]) -> usize {
        let recipients = self.members.select(|id| !excluded.contains(&id));
        deliver(&self.name, recipients, frame).await
    }

    /// Like [`write_all`](Self::write_all) without waiting for delivery.
    pub fn write_all_no_wait<T: Serialize + ?Sized>(
        &self,
        method_id: MethodId,
        value: &T,
    ) -> Result<(), EncodeError> {
        self.write_except_no_wait(method_id, value, &[])
    }

    pub fn write_except_no_wait<T: Serialize + ?Sized>(
        &self,
        method_id: MethodId,
        value: &T,
        excluded: &[ConnectionId],
    ) -> Result<(), EncodeError> {
        let frame = self.encode(method_id, value)?;
        self.write_raw_no_wait(frame, excluded);
        Ok(())
    }

    pub fn write_to_no_wait<T: Serialize + ?Sized>(
        &self,
        method_id: MethodId,
        value: &T,
        targets: &[ConnectionId],
    ) -> Result<(), EncodeError> {
        let frame = self.encode(method_id, value)?;
        let recipients = self.members.select(|id| targets.contains(&id));
        self.spawn_delivery(recipients, frame);
        Ok(())
    }

    pub fn write_raw_no_wait(&self, frame: Bytes, excluded: &[ConnectionId]) {
        let recipients = self.members.select(|id| !excluded.contains(&id));
        self.spawn_delivery(recipients, frame);
    }

    fn spawn_delivery(&self, recipients: Vec<Arc<HubConnection>>, frame: Bytes) {
        let name = self.name.clone();
        tokio::spawn(async move {
            deliver(&name, recipients, frame).await;
        });
    }

    fn encode<T: Serialize + ?Sized>(
        &self,
        method_id: MethodId,
        value: &T,
    ) -> Result<Bytes, EncodeError> {
        FrameHead::Broadcast { method_id }.encode::<S, T>(&self.buffer_pool, value)
    }
}

/// Write `frame` to every recipient concurrently, isolating failures.
async fn deliver(group: &str, recipients: Vec<Arc<HubConnection>>, frame: Bytes) -> usize {
    let total = recipients.len();
    let writes = recipients.into_iter().map(|connection| {
        let frame = frame.clone();
        async move {
            match connection.write(frame).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        group,
                        connection_id = %connection.id(),
                        error = %e,
                        "group: write to member failed"
                    );
                    false
                }
            }
        }
    });
    let delivered = futures::future::join_all(writes)
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count();
    tracing::trace!(group, total, delivered, "group: broadcast done");
    delivered
}

#[cfg(test)]
mod tests {
    use streamhub_core::{Frame, Origin, Transport, method_id};

    use super::*;

    fn member() -> (Arc<HubConnection>, Transport) {
        let (local, remote) = Transport::mem_pair();
        (Arc::new(HubConnection::new(local)), remote)
    }

    async fn received(remote: &Transport) -> Frame {
        let bytes = remote.recv_frame().await.unwrap();
        Frame::decode(&bytes, Origin::Server).unwrap()
    }

    fn strategies() -> [GroupStrategy; 2] {
        [GroupStrategy::ConcurrentMap, GroupStrategy::CopyOnWrite]
    }

    #[tokio::test]
    async fn write_except_skips_excluded_member() {
        for strategy in strategies() {
            let repo = GroupRepository::<MessagePackSerializer>::new(strategy);
            let room = repo.get_or_add("room-42");
            let (a, ra) = member();
            let (b, rb) = member();
            let (c, rc) = member();
            for m in [&a, &b, &c] {
                room.add(m.clone());
            }

            let on_message = method_id("OnMessage");
            let delivered = room.write_except(on_message, "hi", &[a.id()]).await.unwrap();
            assert_eq!(delivered, 2);

            for remote in [&rb, &rc] {
                match received(remote).await {
                    Frame::Broadcast { method_id, args } => {
                        assert_eq!(method_id, on_message);
                        assert_eq!(&args[..], &[0xa2, b'h', b'i']);
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            let nothing =
                tokio::time::timeout(std::time::Duration::from_millis(30), ra.recv_frame()).await;
            assert!(nothing.is_err(), "excluded member received a frame");
        }
    }

    #[tokio::test]
    async fn dead_member_does_not_block_others() {
        for strategy in strategies() {
            let repo = GroupRepository::<MessagePackSerializer>::new(strategy);
            let group = repo.get_or_add("g");
            let (dead, _rd) = member();
            let (b, rb) = member();
            let (c, rc) = member();
            group.add(dead.clone());
            group.add(b);
            group.add(c);
            dead.close().await;

            let delivered = group.write_all(7, &(1, 2)).await.unwrap();
            assert_eq!(delivered, 2);
            assert!(matches!(received(&rb).await, Frame::Broadcast { method_id: 7, .. }));
            assert!(matches!(received(&rc).await, Frame::Broadcast { method_id: 7, .. }));
        }
    }

    #[tokio::test]
    async fn last_member_leaving_removes_group() {
        for strategy in strategies() {
            let repo = GroupRepository::<MessagePackSerializer>::new(strategy);
            let group = repo.get_or_add("lobby");
            let (a, _ra) = member();
            let (b, _rb) = member();
            assert!(group.add(a.clone()));
            assert!(!group.add(a.clone()));
            group.add(b.clone());
            assert_eq!(group.member_count(), 2);

            assert!(group.remove(a.id()));
            assert!(repo.try_get("lobby").is_some());
            assert!(group.remove(b.id()));
            assert!(!group.remove(b.id()));
            assert!(repo.try_get("lobby").is_none());

            // Re-joining a dropped group puts it back.
            group.add(a.clone());
            assert!(Arc::ptr_eq(&repo.try_get("lobby").unwrap(), &group));
        }
    }

    #[tokio::test]
    async fn write_to_selects_targets() {
        let repo = GroupRepository::<MessagePackSerializer>::new(GroupStrategy::CopyOnWrite);
        let group = repo.get_or_add("g");
        let (a, ra) = member();
        let (b, _rb) = member();
        let (c, _rc) = member();
        group.add(a.clone());
        group.add(b.clone());
        group.add(c.clone());

        let delivered = group
            .write_to(1, &(), &[a.id(), b.id()])
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        let delivered = group
            .write_to_except(1, &(), &[a.id(), b.id()], &[b.id()])
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(matches!(received(&ra).await, Frame::Broadcast { method_id: 1, .. }));
    }

    #[tokio::test]
    async fn storage_entries_follow_membership() {
        let repo = GroupRepository::<MessagePackSerializer>::default();
        let group = repo.get_or_add("g");
        let (a, _ra) = member();
        let (b, _rb) = member();
        group.add(a.clone());
        group.add(b.clone());

        let names = group.in_memory_storage::<String>().unwrap();
        names.set(a.id(), "alice".into());
        names.set(b.id(), "bob".into());
        assert!(group.in_memory_storage::<u32>().is_none());

        group.remove(a.id());
        assert_eq!(names.get(a.id()), None);
        assert_eq!(names.all(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn no_wait_broadcast_is_delivered() {
        let repo = GroupRepository::<MessagePackSerializer>::default();
        let group = repo.get_or_add("g");
        let (a, ra) = member();
        group.add(a);
        group.write_all_no_wait(3, &"x").unwrap();
        assert!(matches!(received(&ra).await, Frame::Broadcast { method_id: 3, .. }));
    }

    #[tokio::test]
    async fn concurrent_join_leave_during_broadcast() {
        let repo = GroupRepository::<MessagePackSerializer>::new(GroupStrategy::CopyOnWrite);
        let group = repo.get_or_add("busy");
        let (anchor, _ra) = member();
        group.add(anchor);

        let churn = {
            let group = group.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let (m, _r) = member();
                    group.add(m.clone());
                    group.remove(m.id());
                    tokio::task::yield_now().await;
                }
            })
        };
        for _ in 0..50 {
            group.write_raw_no_wait(Bytes::from_static(&[0x92, 0x01, 0xc0]), &[]);
            tokio::task::yield_now().await;
        }
        churn.await.unwrap();
        assert_eq!(group.member_count(), 1);
    }
}
