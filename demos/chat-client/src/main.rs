//! Line-oriented chat client.
//!
//! Run with: cargo run -p chat-client-demo -- --room lobby --user-id 1 --to 2
//!
//! Each input line is sent as a chat message. `/typing` and `/idle` publish
//! the typing state, `/reconnect` forces a reconnect, `/quit` exits.

use std::time::Duration;

use clap::Parser;
use roomchat_core::{
    ChatEvent, ConnectionState, Direction, MessageId, ReconnectPolicy, SessionCallbacks,
    SessionConfig, TypingEvent,
};
use roomchat_session::{ChatClient, client::reconnect_horizon};
use roomchat_transport::WebSocketTransport;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(about = "Terminal client for a chat room")]
struct Args {
    /// Server base URL.
    #[arg(long, env = "ROOMCHAT_ENDPOINT", default_value = "ws://127.0.0.1:8000")]
    endpoint: String,
    /// Room to join.
    #[arg(long, env = "ROOMCHAT_ROOM")]
    room: String,
    /// Local user id.
    #[arg(long, env = "ROOMCHAT_USER_ID")]
    user_id: String,
    /// Recipient of outgoing messages.
    #[arg(long)]
    to: String,
    /// Delay between reconnect attempts, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    reconnect_delay_ms: u64,
    /// Reconnect attempts before giving up.
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,
    /// Hide repeated deliveries of the same message.
    #[arg(long)]
    dedupe: bool,
}

struct Console;

impl SessionCallbacks for Console {
    fn on_message(&mut self, event: &ChatEvent) {
        let who = match event.direction {
            Direction::Sent => "you".to_string(),
            Direction::Received => event.sender.clone().unwrap_or_else(|| event.sender_id.clone()),
        };
        println!("[{}] {who}: {}", event.timestamp, event.message);
    }

    fn on_delivered(&mut self, id: &MessageId) {
        println!("  ✓ {id}");
    }

    fn on_sent(&mut self, id: &MessageId) {
        println!("  ⌛ {id}");
    }

    fn on_typing(&mut self, event: &TypingEvent) {
        if event.is_typing {
            println!("  {} is typing…", event.user.as_deref().unwrap_or("someone"));
        }
    }

    fn on_connection_lost(&mut self) {
        eprintln!("Unable to reach the chat server. Restart the client to try again.");
    }

    fn on_state_change(&mut self, state: ConnectionState) {
        tracing::info!(?state, "Connection state changed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = SessionConfig::new(&args.endpoint, &args.room)
        .with_current_user(&args.user_id)
        .with_reconnect(ReconnectPolicy::fixed(
            Duration::from_millis(args.reconnect_delay_ms),
            args.max_attempts,
        ))
        .with_dedupe_inbound(args.dedupe);
    tracing::info!(
        url = %config.room_url(),
        give_up_after_secs = reconnect_horizon(&config).as_secs(),
        "Starting chat session"
    );

    let client = ChatClient::spawn(config, WebSocketTransport::new(), Console)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" => break,
            "/typing" => client.set_typing(true),
            "/idle" => client.set_typing(false),
            "/reconnect" => client.open(),
            "/status" => println!("{:?}", client.status()),
            text => {
                client.set_typing(false);
                client.send(text, &args.to).await?;
            }
        }
    }

    let pending = client.pending_count();
    if pending > 0 {
        tracing::warn!(pending, "Exiting with unacknowledged messages");
    }
    client.shutdown().await;
    Ok(())
}
