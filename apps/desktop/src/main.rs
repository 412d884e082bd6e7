use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::load_settings_from, ChatClient, ClientSettings, ConversationEvent, ConversationView,
};
use shared::{domain::ConversationId, protocol::Message};
use storage::SqliteSessionStore;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; missing files fall back to defaults.
    #[arg(long, default_value = client_core::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Overrides `base_url` from the settings file.
    #[arg(long)]
    base_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    Whoami,
    /// Prints a conversation's backlog, oldest first.
    History {
        #[arg(long)]
        conversation: i64,
        #[arg(long)]
        json: bool,
    },
    /// Interactive chat: stdin lines are sent, live traffic is printed.
    Chat {
        #[arg(long)]
        conversation: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config)?;
    if let Some(base_url) = args.base_url {
        settings.base_url = base_url;
    }
    let client = connect(settings).await?;

    match args.command {
        Command::Login { username, password } => {
            let identity = client.login(&username, &password).await?;
            println!(
                "Logged in as {} (participant_id={})",
                identity.display_name.as_deref().unwrap_or(&identity.username),
                identity.participant_id
            );
        }
        Command::Logout => {
            client.logout().await?;
            println!("Logged out");
        }
        Command::Whoami => match client.session().identity().await {
            Some(identity) => println!(
                "{} (participant_id={}, role={:?})",
                identity.username, identity.participant_id, identity.role
            ),
            None => println!("Not logged in"),
        },
        Command::History { conversation, json } => {
            let messages = client.history().load(ConversationId(conversation)).await?;
            for message in &messages {
                if json {
                    println!("{}", serde_json::to_string(message)?);
                } else {
                    print_message(message);
                }
            }
        }
        Command::Chat { conversation } => {
            let view = client
                .open_conversation(ConversationId(conversation))
                .await?;
            chat(view).await?;
        }
    }

    Ok(())
}

async fn connect(settings: ClientSettings) -> Result<ChatClient> {
    let store = SqliteSessionStore::open(&settings.session_database_url)
        .await
        .with_context(|| {
            format!(
                "failed to open session store '{}'",
                settings.session_database_url
            )
        })?;
    info!(base_url = %settings.base_url, "desktop: starting");
    Ok(ChatClient::new(settings, Arc::new(store)).await?)
}

fn print_message(message: &Message) {
    let sender = message
        .sender
        .map(|sender| sender.to_string())
        .unwrap_or_else(|| "system".into());
    println!(
        "[{}] {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        sender,
        message.body
    );
}

async fn next_event(
    events: &mut broadcast::Receiver<ConversationEvent>,
) -> Option<ConversationEvent> {
    match events.recv().await {
        Ok(event) => Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "desktop: event stream lagged, resyncing from the view");
            Some(ConversationEvent::TimelineUpdated)
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

async fn chat(view: ConversationView) -> Result<()> {
    let view = Arc::new(view);
    let mut events = view.subscribe();
    let printer_view = Arc::clone(&view);
    let printer = tokio::spawn(async move {
        let mut printed = HashSet::new();
        while let Some(event) = next_event(&mut events).await {
            match event {
                ConversationEvent::TimelineUpdated | ConversationEvent::HistoryLoaded { .. } => {
                    for message in printer_view.messages().await {
                        if printed.insert(message.id) {
                            print_message(&message);
                        }
                    }
                }
                ConversationEvent::TypingChanged(typing) if !typing.is_empty() => {
                    let names: Vec<String> = typing.iter().map(ToString::to_string).collect();
                    println!("... {} typing", names.join(", "));
                }
                ConversationEvent::ChannelStateChanged(state) => {
                    info!(?state, "desktop: live channel state changed");
                }
                ConversationEvent::ReadReceiptsDropped(dropped) => {
                    warn!(count = dropped.len(), "desktop: read receipts dropped");
                }
                ConversationEvent::Error(error) => eprintln!("error: {error}"),
                ConversationEvent::TypingChanged(_) => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = view.send_message(line, Vec::new()).await {
            eprintln!("send failed: {err}");
        }
    }

    view.close().await;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use client_core::ChannelState;

    #[tokio::test]
    async fn lagging_behind_the_event_stream_keeps_the_printer_running() {
        let (sender, mut events) = broadcast::channel(2);
        for _ in 0..4 {
            sender
                .send(ConversationEvent::TypingChanged(Vec::new()))
                .unwrap();
        }
        sender
            .send(ConversationEvent::ChannelStateChanged(ChannelState::Open))
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            Some(ConversationEvent::TimelineUpdated)
        );
        assert_eq!(
            next_event(&mut events).await,
            Some(ConversationEvent::TypingChanged(Vec::new()))
        );
        assert_eq!(
            next_event(&mut events).await,
            Some(ConversationEvent::ChannelStateChanged(ChannelState::Open))
        );

        drop(sender);
        assert_eq!(next_event(&mut events).await, None);
    }
}
