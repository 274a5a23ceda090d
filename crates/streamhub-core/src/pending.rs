//! Pending-call table.
//!
//! Maps a correlation id to the oneshot sender that completes the waiting
//! call. Two actors touch it: the caller registers before sending, and the
//! read loop removes-and-resolves when the reply arrives. Teardown fails every
//! remaining entry exactly once.

use std::collections::HashMap;
use std::hash::Hash;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{DisconnectReason, RpcError, StatusCode};

pub const DEFAULT_MAX_PENDING: usize = 8192;

/// Outcome delivered to a waiter: the raw result payload or the call's error.
pub type CallResult = Result<Bytes, RpcError>;

/// Reads `STREAMHUB_MAX_PENDING`, falling back to [`DEFAULT_MAX_PENDING`].
pub fn max_pending() -> usize {
    std::env::var("STREAMHUB_MAX_PENDING")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_PENDING)
}

struct Inner<K> {
    waiters: HashMap<K, oneshot::Sender<CallResult>>,
    /// Set once the owning connection is torn down; later registrations fail.
    closed: Option<DisconnectReason>,
    next_id: i32,
}

/// Per-connection table of in-flight calls keyed by `K`.
pub struct PendingTable<K> {
    inner: Mutex<Inner<K>>,
    max_pending: usize,
}

impl<K: Eq + Hash + Copy + std::fmt::Debug> PendingTable<K> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                waiters: HashMap::new(),
                closed: None,
                next_id: 1,
            }),
            max_pending,
        }
    }

    /// Register a waiter under a caller-chosen key. Fails if the key is in use.
    pub fn register(&self, key: K) -> Result<oneshot::Receiver<CallResult>, RpcError> {
        let mut inner = self.inner.lock();
        self.check_open(&inner)?;
        if inner.waiters.contains_key(&key) {
            return Err(RpcError::status(
                StatusCode::AlreadyExists,
                format!("call {key:?} is already pending"),
            ));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(key, tx);
        Ok(rx)
    }

    fn check_open(&self, inner: &Inner<K>) -> Result<(), RpcError> {
        if let Some(reason) = &inner.closed {
            return Err(RpcError::Disconnected(reason.clone()));
        }
        let pending_len = inner.waiters.len();
        if pending_len >= self.max_pending {
            tracing::warn!(
                pending_len,
                max_pending = self.max_pending,
                "too many pending calls; refusing new call"
            );
            return Err(RpcError::status(
                StatusCode::ResourceExhausted,
                "too many pending calls",
            ));
        }
        Ok(())
    }

    /// Resolve and retire the waiter for `key`.
    ///
    /// Returns false if no such call is pending (late or duplicate reply).
    pub fn complete(&self, key: K, result: CallResult) -> bool {
        let waiter = self.inner.lock().waiters.remove(&key);
        match waiter {
            Some(tx) => {
                // The caller may have given up already; the entry is retired either way.
                let _ = tx.send(result);
                true
            }
            None => {
                tracing::debug!(?key, "reply for a call that is not pending");
                false
            }
        }
    }

    /// Drop the waiter for `key` without resolving it.
    pub fn remove(&self, key: K) -> bool {
        self.inner.lock().waiters.remove(&key).is_some()
    }

    /// Fail every pending call with `reason` and refuse new registrations.
    ///
    /// Returns how many calls were cancelled.
    pub fn fail_all(&self, reason: DisconnectReason) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.clone());
            }
            inner.waiters.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::Disconnected(reason.clone())));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: K) -> bool {
        self.inner.lock().waiters.contains_key(&key)
    }
}

impl PendingTable<i32> {
    /// Allocate the next call id and register a waiter for it.
    ///
    /// Ids come from a counter over `1..=i32::MAX` that wraps back to 1. An
    /// id still pending after a wrap is skipped, so a live entry is never
    /// overwritten. The table bound keeps the search short.
    pub fn register_next(&self) -> Result<(i32, oneshot::Receiver<CallResult>), RpcError> {
        let mut inner = self.inner.lock();
        self.check_open(&inner)?;

        let mut call_id = inner.next_id;
        while inner.waiters.contains_key(&call_id) {
            call_id = next_call_id(call_id);
        }
        inner.next_id = next_call_id(call_id);

        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(call_id, tx);
        Ok((call_id, rx))
    }

    /// Sorted ids of calls awaiting a reply (for diagnostics).
    pub fn pending_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.inner.lock().waiters.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[cfg(test)]
    fn set_next_id(&self, id: i32) {
        self.inner.lock().next_id = id;
    }
}

fn next_call_id(id: i32) -> i32 {
    if id == i32::MAX { 1 } else { id + 1 }
}

/// Removes a registered waiter if the call is abandoned before its reply.
///
/// Dropping an in-flight call future (timeout, caller cancellation) must not
/// leave a stale entry behind.
pub struct PendingGuard<'a, K: Eq + Hash + Copy + std::fmt::Debug> {
    table: &'a PendingTable<K>,
    key: K,
    active: bool,
}

impl<'a, K: Eq + Hash + Copy + std::fmt::Debug> PendingGuard<'a, K> {
    pub fn new(table: &'a PendingTable<K>, key: K) -> Self {
        Self {
            table,
            key,
            active: true,
        }
    }

    pub fn disarm(&mut self) {
        self.active = false;
    }
}

impl<K: Eq + Hash + Copy + std::fmt::Debug> Drop for PendingGuard<'_, K> {
    fn drop(&mut self) {
        if self.active && self.table.remove(self.key) {
            tracing::debug!(key = ?self.key, "call abandoned: removed pending waiter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_resolves_exactly_one_waiter() {
        let table = PendingTable::<i32>::new(16);
        let (a, rx_a) = table.register_next().unwrap();
        let (b, rx_b) = table.register_next().unwrap();
        assert_ne!(a, b);

        assert!(table.complete(b, Ok(Bytes::from_static(b"b"))));
        assert!(!table.complete(b, Ok(Bytes::from_static(b"again"))));
        assert_eq!(&rx_b.await.unwrap().unwrap()[..], b"b");

        assert_eq!(table.fail_all(DisconnectReason::CompletedNormally), 1);
        assert!(matches!(
            rx_a.await.unwrap(),
            Err(RpcError::Disconnected(DisconnectReason::CompletedNormally))
        ));
    }

    #[test]
    fn wraparound_skips_ids_still_pending() {
        let table = PendingTable::<i32>::new(16);
        let (first, _rx1) = table.register_next().unwrap();
        assert_eq!(first, 1);

        table.set_next_id(i32::MAX);
        let (last, _rx2) = table.register_next().unwrap();
        assert_eq!(last, i32::MAX);

        // Counter wrapped to 1, which is still pending.
        let (after_wrap, _rx3) = table.register_next().unwrap();
        assert_eq!(after_wrap, 2);
    }

    #[test]
    fn registration_is_bounded() {
        let table = PendingTable::<i32>::new(2);
        let _a = table.register_next().unwrap();
        let _b = table.register_next().unwrap();
        let err = table.register_next().unwrap_err();
        assert_eq!(err.code(), StatusCode::ResourceExhausted);
    }

    #[test]
    fn closed_table_refuses_new_calls() {
        let table = PendingTable::<i32>::new(4);
        table.fail_all(DisconnectReason::TimedOut);
        assert!(matches!(
            table.register_next(),
            Err(RpcError::Disconnected(DisconnectReason::TimedOut))
        ));
    }

    #[test]
    fn guard_removes_abandoned_call() {
        let table = PendingTable::<i32>::new(4);
        let (id, _rx) = table.register_next().unwrap();
        {
            let _guard = PendingGuard::new(&table, id);
        }
        assert!(table.is_empty());

        let (id, _rx) = table.register_next().unwrap();
        let mut guard = PendingGuard::new(&table, id);
        guard.disarm();
        drop(guard);
        assert!(table.contains(id));
    }

    #[test]
    fn keyed_registration_rejects_duplicates() {
        let table = PendingTable::<u128>::new(4);
        let _rx = table.register(7).unwrap();
        assert_eq!(
            table.register(7).unwrap_err().code(),
            StatusCode::AlreadyExists
        );
    }

    #[test]
    fn concurrent_callers_get_unique_ids() {
        let table = std::sync::Arc::new(PendingTable::<i32>::new(100_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..1000)
                        .map(|_| table.register_next().unwrap())
                        .map(|(id, _rx)| id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<i32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8000);
    }
}
