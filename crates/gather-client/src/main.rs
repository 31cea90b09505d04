//! # gather-chat
//!
//! Line-oriented chat front-end. Reads commands from stdin:
//!
//! - `/users [term]` lists users, optionally filtered
//! - `/select <user>` opens a conversation
//! - `/history` prints the open conversation
//! - `/online` lists online users
//! - `/unread` shows unread counts
//! - `/clear` forgets failed sends
//! - `/connect` reconnects after a drop
//! - `/quit` exits
//!
//! Any other line is sent to the selected user.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use gather_client::{ChatClient, ChatSession, ClientConfig, ConnectionEvent, EchoStatus, EventKind};
use gather_shared::constants::APP_NAME;
use gather_shared::{Message, UserIdentity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gather_client=debug,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::from_env();
    info!(server = %config.server_url, "Starting {} chat client", APP_NAME);

    let client = ChatClient::from_config(&config)
        .context("invalid client configuration (is GATHER_USERNAME set?)")?;
    let local = client.local_user().clone();

    let mut events = client.subscribe(&[
        EventKind::MessageReceived,
        EventKind::PeerOnline,
        EventKind::PeerOffline,
        EventKind::Disconnected,
    ]);
    let printer_local = local.clone();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::MessageReceived(message) if !message.is_from(&printer_local) => {
                    println!("{}", render(&message));
                }
                ConnectionEvent::PeerOnline(user) => println!("* {user} is online"),
                ConnectionEvent::PeerOffline(user) => println!("* {user} went offline"),
                ConnectionEvent::Disconnected { reason } => {
                    println!("* disconnected: {reason} (type /connect to retry)")
                }
                _ => {}
            }
        }
    });

    client.connect().await.context("failed to connect to chat server")?;
    match client.load_directory().await {
        Ok(count) => println!("* signed in as {local}, {count} users"),
        Err(e) => warn!(error = %e, "Could not load the user directory"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, arg) = match line.split_once(' ') {
            Some((c, a)) => (c, a.trim()),
            None => (line, ""),
        };

        match command {
            "/quit" => break,
            "/connect" => {
                if let Err(e) = client.connect().await {
                    println!("! {e}");
                }
            }
            "/users" => client.with_session(|s| {
                for profile in s.directory().search(arg) {
                    println!("{}", summary(s, &profile.username));
                }
            }),
            "/online" => {
                let online = client.with_session(|s| s.online());
                let names: Vec<String> = online.iter().map(|u| u.to_string()).collect();
                println!("* online: {}", names.join(", "));
            }
            "/unread" => client.with_session(|s| {
                for peer in s.conversations().peers() {
                    let unread = s.unread_count(&peer);
                    if unread > 0 {
                        println!("{peer}: {unread}");
                    }
                }
                println!("* total unread: {}", s.total_unread());
            }),
            "/select" => match UserIdentity::parse(arg) {
                Ok(peer) => match client.select_peer(peer).await {
                    Ok(()) => client.with_session(print_transcript),
                    Err(e) => println!("! {e}"),
                },
                Err(e) => println!("! {e}"),
            },
            "/history" => client.with_session(print_transcript),
            "/clear" => println!("* cleared {} failed sends", client.clear_failed()),
            _ if command.starts_with('/') => println!("! unknown command {command}"),
            _ => match client.send(line).await {
                Ok(message) => println!("{}", render(&message)),
                Err(e) => println!("! not sent: {e}"),
            },
        }
    }

    client.disconnect();
    printer.abort();
    info!("Chat client stopped");
    Ok(())
}

fn render(message: &Message) -> String {
    format!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M"),
        message.sender_id,
        message.content
    )
}

fn summary(session: &ChatSession, peer: &UserIdentity) -> String {
    let status = if session.is_online(peer) { "online" } else { "offline" };
    let unread = session.unread_count(peer);
    let preview = session
        .last_message(peer)
        .map(|m| m.content.chars().take(40).collect::<String>())
        .unwrap_or_default();
    format!("{peer} ({status}) [{unread}] {preview}")
}

fn print_transcript(session: &ChatSession) {
    let Some(peer) = session.selected_peer() else {
        println!("! no conversation open");
        return;
    };
    println!("--- {} ---", summary(session, peer));
    for message in session.transcript() {
        println!("{}", render(message));
    }
    for echo in session.pending_for(peer) {
        let mark = match echo.status {
            EchoStatus::Pending => "sending",
            EchoStatus::Failed => "failed",
        };
        println!("({mark}) {}", echo.message.content);
    }
}
