//! Interactive chat client. Lines typed on stdin are sent to the room.
//!
//! ```text
//! cargo run -p streamhub --example chat_client -- 127.0.0.1:5050 room-42 alice
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use streamhub::{ClientOptions, HubClient, MethodDescriptor, ReceiverTable, Transport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

const JOIN: MethodDescriptor = MethodDescriptor::new("JoinAsync");
const SEND_MESSAGE: MethodDescriptor = MethodDescriptor::new("SendMessage");
const ON_MESSAGE: MethodDescriptor = MethodDescriptor::new("OnMessage");

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    user: String,
    text: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    streamhub::tracing_setup::init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:5050".to_string());
    let room = args.next().unwrap_or_else(|| "room-42".to_string());
    let user = args.next().unwrap_or_else(|| "anonymous".to_string());

    let stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(true)?;

    let receivers = ReceiverTable::new().on(ON_MESSAGE, |message: ChatMessage| {
        println!("[{}] {}", message.user, message.text);
    });
    let options = ClientOptions::default()
        .with_heartbeat_interval(Some(Duration::from_secs(5)))
        .on_client_heartbeat_response(|event| {
            tracing::debug!(rtt = ?event.round_trip_time, "heartbeat");
        });
    let client: HubClient = HubClient::connect("ChatHub", Transport::stream(stream), receivers, options).await?;

    let members: usize = client.invoke(JOIN, &(&room, &user)).await?;
    println!("joined {room} ({members} online)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.is_empty() {
                    continue;
                }
                let _: usize = client.invoke(SEND_MESSAGE, &line).await?;
            }
            reason = client.wait_for_disconnect() => {
                println!("disconnected: {reason}");
                return Ok(());
            }
        }
    }

    let reason = client.dispose().await;
    println!("bye ({reason})");
    Ok(())
}
