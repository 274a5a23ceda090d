//! streamhub-core: wire-level building blocks for the streamhub RPC runtime.
//!
//! This crate defines:
//! - Messages and their MessagePack encoding ([`Frame`], [`FrameHead`])
//! - Method identifiers ([`MethodId`], [`method_id`], [`MethodDescriptor`])
//! - Payload serialization ([`PayloadSerializer`], [`MessagePackSerializer`])
//! - Transports ([`Transport`]) over in-process channels or byte streams
//! - The pending-call table ([`PendingTable`], [`PendingGuard`])
//! - The ordered outbound queue ([`WriteQueue`])
//! - Status codes and errors ([`StatusCode`], [`RpcError`])
//!
//! Sessions, dispatch and groups live in the `streamhub` crate.

mod buffer_pool;
mod error;
mod frame;
mod method_id;
mod pending;
mod serializer;
mod transport;
mod write_queue;

pub use buffer_pool::*;
pub use error::*;
pub use frame::*;
pub use method_id::*;
pub use pending::*;
pub use serializer::*;
pub use transport::*;
pub use write_queue::*;
