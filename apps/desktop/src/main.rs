use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    load_config, CommandOutcome, ConnectionSession, ConversationView, Notification,
    NotificationGateway, NotificationSink, PreferenceStore, RoomDirectory, SessionEvent,
};
use shared::protocol::Command;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(about = "Terminal chat client")]
struct Args {
    /// Account email; omit to resume a stored session.
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Room to join after connecting.
    #[arg(long)]
    room: Option<String>,
    /// Disable notifications for inbound messages.
    #[arg(long)]
    no_notifications: bool,
}

struct StderrSink;

impl NotificationSink for StderrSink {
    fn show(&self, note: &Notification) {
        eprintln!("* {}: {}", note.title, note.body);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let prefs = Arc::new(PreferenceStore::open(PreferenceStore::default_path()));
    let session = ConnectionSession::new(load_config(), Arc::clone(&prefs));

    if let (Some(email), Some(password)) = (args.email.as_deref(), args.password.as_deref()) {
        let user = session.login(email, password).await?;
        println!("Logged in as {}", user.username);
    } else if session.is_authenticated().await {
        match session.fetch_current_user().await {
            Ok(user) => println!("Resumed session as {}", user.username),
            Err(err) => eprintln!("Stored token rejected: {err}"),
        }
    }

    let directory = RoomDirectory::new(Arc::clone(&session));
    directory.start();

    let gateway = NotificationGateway::new(!args.no_notifications, Arc::new(StderrSink));
    let mut view = ConversationView::new();
    view.set_current_user(session.current_user().await.as_ref());

    let mut events = session.subscribe();
    session.connect().await;

    let rooms = directory.refresh().await;
    if !rooms.is_empty() {
        println!("Rooms:");
        for room in &rooms {
            println!("  {} ({} online)", room.name, room.participants);
        }
    }
    if let Some(room_name) = args.room.as_deref() {
        match rooms.iter().find(|room| room.name == room_name) {
            Some(room) => directory.join_room(room, None).await?,
            None => eprintln!("No such room: {room_name}"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Connectivity(state)) => {
                    eprintln!("-- connection {state:?}");
                }
                Ok(SessionEvent::Frame(frame)) => {
                    if let Some(message) = view.ingest(&frame) {
                        println!(
                            "[{}] {}: {}",
                            message.timestamp.format("%H:%M"),
                            message.sender_label,
                            message.content
                        );
                        if !message.is_own {
                            // A terminal session has no focused-window signal.
                            gateway.deliver(
                                false,
                                &Notification::new(
                                    message.sender_label.clone(),
                                    message.content.clone(),
                                ),
                            );
                        }
                    }
                }
                Ok(SessionEvent::AuthChanged(user)) => {
                    view.set_current_user(user.as_ref());
                }
                Ok(SessionEvent::ReconnectsExhausted { attempts }) => {
                    eprintln!("Gave up reconnecting after {attempts} attempts");
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "dropped session events");
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "/quit" {
                        break;
                    }
                    handle_line(&session, &directory, line).await;
                }
                None => break,
            },
        }
    }

    session.close().await;
    Ok(())
}

async fn handle_line(session: &Arc<ConnectionSession>, directory: &Arc<RoomDirectory>, line: &str) {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let result = match verb {
        "/rooms" => {
            for room in directory.refresh().await {
                println!("  {} ({} online)", room.name, room.participants);
            }
            Ok(())
        }
        "/join" => match parts.next() {
            Some(name) => {
                let password = parts.next();
                match directory.snapshot().await.iter().find(|room| room.name == name) {
                    Some(room) => directory.join_room(room, password).await,
                    None => session
                        .send_command(&Command::JoinRoom {
                            name: name.to_string(),
                            password: password.map(str::to_string),
                        })
                        .await
                        .map(|_| ()),
                }
            }
            None => {
                eprintln!("usage: /join <room> [password]");
                Ok(())
            }
        },
        "/create" => match parts.next() {
            Some(name) => directory.create_room(name, parts.next()).await.map(|_| ()),
            None => {
                eprintln!("usage: /create <room> [password]");
                Ok(())
            }
        },
        "/color" => match parts.next() {
            Some(hex) => session.change_color(hex).await,
            None => {
                eprintln!("usage: /color #RRGGBB");
                Ok(())
            }
        },
        "/history" => match session.fetch_history().await {
            Ok(CommandOutcome::Response(response)) => {
                for entry in response.history.unwrap_or_default() {
                    println!("  {entry}");
                }
                Ok(())
            }
            Ok(CommandOutcome::Sent) => Ok(()),
            Err(err) => Err(err),
        },
        "/list" => match session.list_users().await {
            Ok(CommandOutcome::Response(response)) => {
                for user in response.users.unwrap_or_default() {
                    println!("  {}", serde_json::to_string(&user).unwrap_or_default());
                }
                Ok(())
            }
            Ok(CommandOutcome::Sent) => Ok(()),
            Err(err) => Err(err),
        },
        // Anything else, slash-prefixed or not, goes to the server as-is.
        _ => session.send_text(line).await.map(|_| ()),
    };
    if let Err(err) = result {
        eprintln!("error: {err}");
    }
}
