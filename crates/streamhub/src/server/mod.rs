//! Server side of a StreamingHub: per-connection sessions, method dispatch,
//! the hub context handlers see, and server-initiated heartbeats.

mod connection;
mod context;
mod dispatch;
mod heartbeat;
mod session;

pub use connection::{ConnectionId, HubConnection};
pub use context::{ClientProxy, HubContext};
pub use dispatch::{
    DispatchError, HandlerFuture, MethodEntry, MethodTable, MethodTableBuilder,
};
pub use heartbeat::{HeartbeatHandle, HeartbeatManager};
pub use session::{HubService, StreamingHub};
