//! streamhub: bidirectional StreamingHub RPC over one duplex stream.
//!
//! A client opens one connection to a hub and multiplexes over it:
//! fire-and-forget requests, request/response calls correlated by call id,
//! server broadcasts to named groups, and server-to-client calls answered
//! with a result. Both sides probe each other with heartbeats.
//!
//! - [`client`]: [`ClientSession`] state machine and the typed [`HubClient`]
//! - [`server`]: [`HubService`], per-connection [`HubContext`], dispatch tables
//! - [`group`]: broadcast groups with a concurrent-map or copy-on-write member set
//! - [`config`]: [`ClientOptions`] and [`HubOptions`]
//!
//! The wire codec, transports and call bookkeeping come from
//! [`streamhub_core`], re-exported here.

pub mod client;
pub mod config;
pub mod group;
pub mod server;
mod timer;
pub mod tracing_setup;

pub use client::{ClientSession, HubClient, ReceiverTable, SessionState};
pub use config::{ClientHeartbeatEvent, ClientOptions, HubOptions, ServerHeartbeatEvent};
pub use group::{Group, GroupRepository, GroupStrategy, InMemoryStorage};
pub use server::{ClientProxy, HubContext, HubService, MethodTable, StreamingHub};
pub use streamhub_core;
pub use streamhub_core::{
    DisconnectReason, HandshakeError, MethodDescriptor, RpcError, StatusCode, Transport,
};

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic in handler: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic in handler: {s}")
    } else {
        "panic in handler".to_string()
    }
}
