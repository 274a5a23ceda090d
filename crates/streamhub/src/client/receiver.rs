//! Client-side receivers: broadcast handlers and client-result handlers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use streamhub_core::{
    BufferPool, DecodeError, MessagePackSerializer, MethodDescriptor, MethodId,
    PayloadSerializer, RpcError,
};

type BroadcastHandler = Arc<dyn Fn(Bytes) -> Result<(), DecodeError> + Send + Sync>;
type ClientResultHandler =
    Arc<dyn Fn(Bytes, BufferPool) -> BoxFuture<'static, Result<Bytes, RpcError>> + Send + Sync>;

/// Handlers the server can reach on this client, keyed by method id.
///
/// Broadcast handlers run on the read loop and should return quickly.
/// Client-result handlers run on their own task.
pub struct ReceiverTable<S = MessagePackSerializer> {
    broadcasts: HashMap<MethodId, (&'static str, BroadcastHandler)>,
    client_results: HashMap<MethodId, (&'static str, ClientResultHandler)>,
    _serializer: PhantomData<fn() -> S>,
}

impl<S> Default for ReceiverTable<S> {
    fn default() -> Self {
        Self {
            broadcasts: HashMap::new(),
            client_results: HashMap::new(),
            _serializer: PhantomData,
        }
    }
}

impl<S> fmt::Debug for ReceiverTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverTable")
            .field("broadcasts", &self.broadcasts.len())
            .field("client_results", &self.client_results.len())
            .finish()
    }
}

impl<S: PayloadSerializer> ReceiverTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle broadcasts of `method`. `A` follows the argument packing rule.
    pub fn on<A, F>(self, method: MethodDescriptor, handler: F) -> Self
    where
        A: DeserializeOwned + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        self.on_raw(method, move |payload| {
            handler(S::deserialize(&payload)?);
            Ok(())
        })
    }

    pub fn on_raw<F>(mut self, method: MethodDescriptor, handler: F) -> Self
    where
        F: Fn(Bytes) -> Result<(), DecodeError> + Send + Sync + 'static,
    {
        if self
            .broadcasts
            .insert(method.id, (method.name, Arc::new(handler)))
            .is_some()
        {
            tracing::warn!(method = method.name, method_id = method.id, "receiver: handler replaced");
        }
        self
    }

    /// Answer server calls to `method` with the handler's result.
    pub fn on_client_result<A, R, F, Fut>(mut self, method: MethodDescriptor, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ClientResultHandler = Arc::new(move |args, pool| {
            let handler = handler.clone();
            Box::pin(async move {
                let args: A = S::deserialize(&args)?;
                let result = handler(args).await?;
                let mut buf = pool.get();
                S::serialize(&result, &mut buf)?;
                Ok(buf.freeze())
            })
        });
        if self
            .client_results
            .insert(method.id, (method.name, erased))
            .is_some()
        {
            tracing::warn!(method = method.name, method_id = method.id, "receiver: client result handler replaced");
        }
        self
    }

    pub(crate) fn into_receivers(self) -> Receivers {
        Receivers {
            broadcasts: self.broadcasts,
            client_results: self.client_results,
        }
    }
}

/// Serializer-erased receivers held by a running session.
pub(crate) struct Receivers {
    broadcasts: HashMap<MethodId, (&'static str, BroadcastHandler)>,
    client_results: HashMap<MethodId, (&'static str, ClientResultHandler)>,
}

impl Receivers {
    pub(crate) fn broadcast(&self, method_id: MethodId) -> Option<(&'static str, &BroadcastHandler)> {
        self.broadcasts.get(&method_id).map(|(name, h)| (*name, h))
    }

    pub(crate) fn client_result(
        &self,
        method_id: MethodId,
    ) -> Option<(&'static str, &ClientResultHandler)> {
        self.client_results.get(&method_id).map(|(name, h)| (*name, h))
    }
}
