//! Method dispatch table.
//!
//! A [`MethodTable`] maps a wire method id to a type-erased handler that
//! decodes the packed arguments, invokes the hub method and encodes its
//! result. Tables are built once per hub type and shared by every connection.

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
    MessagePackSerializer, MethodDescriptor, MethodId, PayloadSerializer, RpcError,
};

use super::HubContext;

/// Future returned by an erased handler: the encoded result payload.
pub type HandlerFuture = BoxFuture<'static, Result<Bytes, RpcError>>;

type Handler<H> = Arc<dyn Fn(Arc<H>, HubContext, Bytes) -> HandlerFuture + Send + Sync>;

pub struct MethodEntry<H> {
    descriptor: MethodDescriptor,
    handler: Handler<H>,
}

impl<H> MethodEntry<H> {
    pub fn descriptor(&self) -> MethodDescriptor {
        self.descriptor
    }

    /// Decode `args`, run the method on `hub`, and encode the result.
    pub fn invoke(&self, hub: Arc<H>, ctx: HubContext, args: Bytes) -> HandlerFuture {
        (self.handler)(hub, ctx, args)
    }
}

impl<H> fmt::Debug for MethodEntry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Immutable lookup from method id to handler for hubs of type `H`.
pub struct MethodTable<H> {
    hub_name: String,
    methods: HashMap<MethodId, MethodEntry<H>>,
}

impl<H> MethodTable<H> {
    pub fn builder(hub_name: impl Into<String>) -> MethodTableBuilder<H>
    where
        H: Send + Sync + 'static,
    {
        MethodTableBuilder::new(hub_name)
    }

    pub fn hub_name(&self) -> &str {
        &self.hub_name
    }

    pub fn get(&self, method_id: MethodId) -> Option<&MethodEntry<H>> {
        self.methods.get(&method_id)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = MethodDescriptor> + '_ {
        self.methods.values().map(|e| e.descriptor)
    }
}

impl<H> fmt::Debug for MethodTable<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("hub_name", &self.hub_name)
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// Raised when a table cannot be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Two methods hash (or were pinned) to the same wire id.
    DuplicateMethodId {
        id: MethodId,
        first: &'static str,
        second: &'static str,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateMethodId { id, first, second } => write!(
                f,
                "methods '{first}' and '{second}' share method id {id}; assign an explicit id to one of them"
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

pub struct MethodTableBuilder<H, S = MessagePackSerializer> {
    hub_name: String,
    entries: Vec<MethodEntry<H>>,
    _serializer: PhantomData<fn() -> S>,
}

impl<H, S> MethodTableBuilder<H, S>
where
    H: Send + Sync + 'static,
    S: PayloadSerializer,
{
    pub fn new(hub_name: impl Into<String>) -> Self {
        Self {
            hub_name: hub_name.into(),
            entries: Vec::new(),
            _serializer: PhantomData,
        }
    }

    /// Register a method. `A` is the packed argument type: `()` for none,
    /// the value itself for one, a tuple for several.
    pub fn method<A, R, F, Fut>(mut self, descriptor: MethodDescriptor, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<H>, HubContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler<H> = Arc::new(move |hub, ctx, args| {
            let handler = handler.clone();
            Box::pin(async move {
                let args: A = S::deserialize(&args)?;
                let result = handler(hub, ctx.clone(), args).await?;
                let mut buf = ctx.buffer_pool().get();
                S::serialize(&result, &mut buf)?;
                Ok(buf.freeze())
            })
        });
        self.entries.push(MethodEntry {
            descriptor,
            handler: erased,
        });
        self
    }

    /// Register a method that works on raw payload bytes.
    pub fn raw_method<F, Fut>(mut self, descriptor: MethodDescriptor, handler: F) -> Self
    where
        F: Fn(Arc<H>, HubContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, RpcError>> + Send + 'static,
    {
        let erased: Handler<H> = Arc::new(move |hub, ctx, args| Box::pin(handler(hub, ctx, args)));
        self.entries.push(MethodEntry {
            descriptor,
            handler: erased,
        });
        self
    }

    pub fn build(self) -> Result<MethodTable<H>, DispatchError> {
        let mut methods: HashMap<MethodId, MethodEntry<H>> = HashMap::with_capacity(self.entries.len());
        for entry in self.entries {
            let id = entry.descriptor.id;
            if let Some(existing) = methods.get(&id) {
                return Err(DispatchError::DuplicateMethodId {
                    id,
                    first: existing.descriptor.name,
                    second: entry.descriptor.name,
                });
            }
            methods.insert(id, entry);
        }
        tracing::debug!(hub = %self.hub_name, methods = methods.len(), "method table built");
        Ok(MethodTable {
            hub_name: self.hub_name,
            methods,
        })
    }
}
