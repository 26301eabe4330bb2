//! comfy-cli: terminal client for the Comfy chat server
//!
//! # Subcommands
//! - `chat [--mood <mood>] [--session <id>]` interactive chat with streamed replies
//! - `history`                               list your chat sessions
//! - `load <id>`                             print one session's messages
//! - `delete <id>`                           delete a session
//! - `status`                                show server health

mod api;
mod consumer;
mod identity;
mod moods;

use std::io::Write;

use anyhow::bail;
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use api::{ComfyClient, SessionSummary, DEFAULT_SERVER};
use consumer::{Conversation, PendingRequests, SendOutcome};
use moods::{find_mood, mood_names};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "comfy-cli", version, about = "Comfy, your confidence companion, in the terminal")]
struct Cli {
    /// Comfy server URL (overrides COMFY_SERVER_URL env var)
    #[arg(long, env = "COMFY_SERVER_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// User id to chat as; a guest id is created and stored locally if omitted
    #[arg(long, env = "COMFY_USER_ID")]
    user: Option<String>,

    /// Where the guest id is kept
    #[arg(long, default_value = identity::DEFAULT_ID_FILE)]
    id_file: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Chat interactively
    Chat {
        /// Starting mood: Excited, Chill, Focused, Tired or Curious
        #[arg(short, long)]
        mood: Option<String>,

        /// Continue an existing session
        #[arg(short, long)]
        session: Option<String>,
    },

    /// List chat sessions, most recent first
    History,

    /// Print the messages of a session
    Load { session_id: String },

    /// Delete a session and its messages
    Delete { session_id: String },

    /// Show Comfy server status
    Status,
}

// ============================================================================
// Commands
// ============================================================================

fn print_sessions(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No chats yet.");
        return;
    }
    for s in sessions {
        let when = Local
            .timestamp_millis_opt(s.timestamp)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "?".to_string());
        let preview: String = s.last_message.chars().take(60).collect();
        println!("{}  {}  [{}] {}", s.id, when, s.mood, s.title);
        if !preview.is_empty() {
            println!("    {}", preview);
        }
    }
}

fn print_messages(conversation: &Conversation) {
    for m in &conversation.messages {
        let who = if m.is_assistant() { "comfy" } else { "you" };
        println!("{:>5}: {}", who, m.content);
    }
}

async fn do_history(client: &ComfyClient, user_id: &str) -> anyhow::Result<()> {
    let sessions = client.history(user_id).await?;
    print_sessions(&sessions);
    Ok(())
}

async fn do_load(client: &ComfyClient, session_id: &str) -> anyhow::Result<()> {
    let loaded = client.load_session(session_id).await?;
    let mut conversation = Conversation::default();
    conversation.adopt_loaded(session_id, loaded);
    if let Some(mood) = &conversation.mood {
        println!("Mood: {}\n", mood);
    }
    print_messages(&conversation);
    Ok(())
}

async fn do_delete(client: &ComfyClient, session_id: &str) -> anyhow::Result<()> {
    client.delete_session(session_id).await?;
    println!("Chat deleted.");
    Ok(())
}

async fn do_status(client: &ComfyClient) -> anyhow::Result<()> {
    match client.health().await {
        Ok(body) => {
            println!("Comfy server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:      {}", body["version"].as_str().unwrap_or("?"));
            println!("Store:        {}", body["store_detail"].as_str().unwrap_or("?"));
            println!("Model:        {}", body["model"].as_str().unwrap_or("?"));
            Ok(())
        }
        Err(e) => bail!("cannot reach {}: {}", client.base(), e),
    }
}

/// Send one line and print the reply as it streams in.
async fn chat_turn(
    client: &ComfyClient,
    conversation: &mut Conversation,
    pending: &PendingRequests,
    user_id: &str,
    line: &str,
) {
    let key = format!("send_{}", chrono::Utc::now().timestamp_millis());
    let token = pending.insert(&key);

    print!("comfy: ");
    let _ = std::io::stdout().flush();
    let mut printed = 0;
    let outcome = conversation
        .send(client, user_id, line, &token, |text| {
            if let Some(new) = text.get(printed..) {
                print!("{}", new);
                let _ = std::io::stdout().flush();
            }
            printed = text.len();
        })
        .await;
    pending.remove(&key);

    match outcome {
        SendOutcome::Completed(reply) => {
            tracing::debug!(bytes = reply.len(), "Reply complete");
            println!("\n");
        }
        SendOutcome::Aborted => println!("\n(stopped)\n"),
        SendOutcome::Failed(error) => {
            tracing::debug!(error = %error, "Reply failed");
            if let Some(last) = conversation.messages.last() {
                println!("{}\n", last.content);
            }
        }
        SendOutcome::Skipped => println!(),
    }
}

async fn do_chat(
    client: &ComfyClient,
    user_id: &str,
    mood: Option<String>,
    session: Option<String>,
) -> anyhow::Result<()> {
    let mood = match mood {
        Some(name) => match find_mood(&name) {
            Some(m) => Some(m),
            None => bail!("unknown mood '{}'; choose one of {}", name, mood_names()),
        },
        None => None,
    };

    let mut conversation = Conversation::new(mood);
    if let Some(id) = session {
        let loaded = client.load_session(&id).await?;
        conversation.adopt_loaded(&id, loaded);
    }
    conversation.refresh_history(client, user_id).await;

    // Ctrl-C stops the reply in flight; with nothing in flight it exits.
    let pending = PendingRequests::new();
    let interrupt = pending.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt.abort_all() == 0 {
                println!();
                std::process::exit(130);
            }
        }
    });

    println!("Chatting as {} (/new, /history, /load <id>, /delete <id>, /quit)\n", user_id);
    print_messages(&conversation);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  you: ");
        let _ = std::io::stdout().flush();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) | ("/exit", _) => break,
            ("/new", _) => {
                conversation.reset();
                println!("Started a new chat.\n");
            }
            ("/history", _) => {
                conversation.refresh_history(client, user_id).await;
                print_sessions(&conversation.sessions);
            }
            ("/load", id) if !id.trim().is_empty() => match client.load_session(id.trim()).await {
                Ok(loaded) => {
                    conversation.adopt_loaded(id.trim(), loaded);
                    print_messages(&conversation);
                }
                Err(e) => eprintln!("comfy-cli: {}", e),
            },
            ("/delete", id) if !id.trim().is_empty() => {
                let id = id.trim();
                match client.delete_session(id).await {
                    Ok(()) => {
                        if conversation.session_id.as_deref() == Some(id) {
                            conversation.reset();
                        }
                        conversation.refresh_history(client, user_id).await;
                        println!("Chat deleted.\n");
                    }
                    Err(e) => eprintln!("comfy-cli: {}", e),
                }
            }
            (cmd, _) if cmd.starts_with('/') => eprintln!("comfy-cli: unknown command {}", cmd),
            _ => chat_turn(client, &mut conversation, &pending, user_id, line).await,
        }
    }

    pending.abort_all();
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let result = run(cli).await;
    if let Err(e) = result {
        eprintln!("comfy-cli: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = ComfyClient::new(&cli.server)?;
    let user_id = match cli.user.filter(|u| !u.trim().is_empty()) {
        Some(u) => u,
        None => identity::load_or_create(&cli.id_file)?,
    };

    match cli.command {
        Commands::Chat { mood, session } => do_chat(&client, &user_id, mood, session).await,
        Commands::History => do_history(&client, &user_id).await,
        Commands::Load { session_id } => do_load(&client, &session_id).await,
        Commands::Delete { session_id } => do_delete(&client, &session_id).await,
        Commands::Status => do_status(&client).await,
    }
}
