//! Chat hub over TCP.
//!
//! ```text
//! cargo run -p streamhub --example chat_server -- 127.0.0.1:5050
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use streamhub::server::{HubContext, MethodTable};
use streamhub::{Group, HubOptions, HubService, MethodDescriptor, RpcError, StatusCode, StreamingHub, Transport};
use tokio::net::TcpListener;

const JOIN: MethodDescriptor = MethodDescriptor::new("JoinAsync");
const SEND_MESSAGE: MethodDescriptor = MethodDescriptor::new("SendMessage");
const ON_MESSAGE: MethodDescriptor = MethodDescriptor::new("OnMessage");

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    user: String,
    text: String,
}

#[derive(Default)]
struct Chat {
    joined: Mutex<Option<(Arc<Group>, String)>>,
}

impl StreamingHub for Chat {
    async fn on_connected(&self, ctx: &HubContext) {
        tracing::info!(connection_id = %ctx.connection_id(), "chat: connected");
    }

    async fn on_disconnected(&self, ctx: &HubContext) {
        let joined = self.joined.lock().take();
        if let Some((room, user)) = joined {
            let notice = ChatMessage {
                user: "server".into(),
                text: format!("{user} left"),
            };
            if let Err(e) = room.write_all_no_wait(ON_MESSAGE.id, &notice) {
                tracing::warn!(error = %e, "chat: failed to announce departure");
            }
        }
        tracing::info!(connection_id = %ctx.connection_id(), "chat: disconnected");
    }
}

fn chat_table() -> MethodTable<Chat> {
    MethodTable::<Chat>::builder("ChatHub")
        .method(JOIN, |hub: Arc<Chat>, ctx: HubContext, (room, user): (String, String)| async move {
            let group = ctx.join(&room);
            tracing::info!(room = %room, user = %user, members = group.member_count(), "chat: joined");
            *hub.joined.lock() = Some((group.clone(), user));
            Ok::<_, RpcError>(group.member_count())
        })
        .method(SEND_MESSAGE, |hub: Arc<Chat>, ctx: HubContext, text: String| async move {
            let joined = hub.joined.lock().clone();
            let Some((room, user)) = joined else {
                return Err(RpcError::status(StatusCode::FailedPrecondition, "join a room first"));
            };
            let delivered = room
                .write_except(ON_MESSAGE.id, &ChatMessage { user, text }, &[ctx.connection_id()])
                .await?;
            Ok(delivered)
        })
        .build()
        .expect("chat methods have distinct ids")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    streamhub::tracing_setup::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5050".to_string());
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "chat server listening");

    let options = HubOptions::default().with_heartbeat(Duration::from_secs(5), Some(Duration::from_secs(15)));
    let service = HubService::new(chat_table(), |_: &HubContext| Chat::default(), options);

    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let service = service.clone();
        tokio::spawn(async move {
            let reason = service.serve(Transport::stream(stream)).await;
            tracing::info!(%peer, %reason, "connection ended");
        });
    }
}
