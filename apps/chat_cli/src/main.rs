use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    load_settings, ClientEvent, ClientSettings, LocalAttachment, RealtimeClient, SendIntent,
};
use shared::{
    domain::{ChatMessage, MessageId, MessageKind},
    rich_text::first_text_run,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the community chat room")]
struct Args {
    /// TOML settings file; CHAT_* environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    ws_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    history_limit: Option<u32>,
}

impl Args {
    fn apply(self, mut settings: ClientSettings) -> ClientSettings {
        if let Some(v) = self.server_url {
            settings.server_url = v;
        }
        if let Some(v) = self.ws_url {
            settings.websocket_url = Some(v);
        }
        if let Some(v) = self.token {
            settings.token = v;
        }
        if let Some(v) = self.user_id {
            settings.user_id = v;
        }
        if let Some(v) = self.username {
            settings.username = v;
        }
        if let Some(v) = self.display_name {
            settings.display_name = v;
        }
        if let Some(v) = self.database_url {
            settings.database_url = v;
        }
        if let Some(v) = self.history_limit {
            settings.history_limit = v;
        }
        settings
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Send(String),
    Reply(MessageId),
    CancelReply,
    React { message_id: MessageId, emoji: String },
    Attach {
        kind: MessageKind,
        path: PathBuf,
        text: String,
    },
    Members,
    Typing,
    StartTyping,
    History,
    Quit,
    Nothing,
    Invalid(String),
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Nothing;
    }
    if !line.starts_with('/') {
        return Command::Send(line.to_string());
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();

    match name {
        "/reply" if !rest.is_empty() => Command::Reply(MessageId::new(rest)),
        "/reply" => Command::Invalid("usage: /reply <message-id>".into()),
        "/cancel-reply" => Command::CancelReply,
        "/react" => match rest.split_once(char::is_whitespace) {
            Some((id, emoji)) if !emoji.trim().is_empty() => Command::React {
                message_id: MessageId::new(id),
                emoji: emoji.trim().to_string(),
            },
            _ => Command::Invalid("usage: /react <message-id> <emoji>".into()),
        },
        "/attach" => {
            let mut args = rest.splitn(3, char::is_whitespace);
            let kind = args.next().and_then(MessageKind::parse_lenient);
            let path = args.next().filter(|p| !p.is_empty());
            match (kind, path) {
                (Some(kind), Some(path)) if kind.is_media() => Command::Attach {
                    kind,
                    path: PathBuf::from(path),
                    text: args.next().unwrap_or_default().trim().to_string(),
                },
                _ => Command::Invalid(
                    "usage: /attach <image|video|audio|file> <path> [text]".into(),
                ),
            }
        }
        "/members" => Command::Members,
        "/typing" if rest == "on" => Command::StartTyping,
        "/typing" if rest.is_empty() => Command::Typing,
        "/typing" => Command::Invalid("usage: /typing [on]".into()),
        "/history" => Command::History,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Invalid(format!("unknown command {other}")),
    }
}

fn format_message(message: &ChatMessage, pending: bool) -> String {
    let mut line = format!(
        "[{}] {} <{}>",
        message.created_at.format("%H:%M"),
        message.id,
        message.author.name
    );
    if let Some(reply) = &message.reply_preview {
        line.push_str(&format!(" (re {}: {})", reply.username, reply.text_preview));
    }
    if let Some(text) = first_text_run(&message.content) {
        line.push(' ');
        line.push_str(&text);
    }
    if let (true, Some(url)) = (message.kind.is_media(), &message.media_url) {
        line.push_str(&format!(" [{:?} {url}]", message.kind));
    }
    if !message.reactions.is_empty() {
        let emojis: Vec<&str> = message.reactions.iter().map(|r| r.emoji.as_str()).collect();
        line.push_str(&format!(" {{{}}}", emojis.join(" ")));
    }
    if pending {
        line.push_str(" ⋯");
    }
    line
}

fn spawn_event_printer(client: &Arc<RealtimeClient>) -> tokio::task::JoinHandle<()> {
    let client = Arc::clone(client);
    let mut events = BroadcastStream::new(client.subscribe_events());
    tokio::spawn(async move {
        let mut printed: HashSet<MessageId> = HashSet::new();
        let mut awaiting: HashSet<MessageId> = HashSet::new();
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "event printer lagged");
                    continue;
                }
            };
            match event {
                ClientEvent::MessagesChanged => {
                    for message in client.messages().await {
                        let pending = client.has_pending_reaction(&message.id).await;
                        if printed.insert(message.id.clone()) {
                            println!("{}", format_message(&message, pending));
                        } else if pending && awaiting.insert(message.id.clone()) {
                            println!("{}", format_message(&message, true));
                        } else if !pending && awaiting.remove(&message.id) {
                            println!("{}", format_message(&message, false));
                        }
                    }
                }
                ClientEvent::TypingChanged => {
                    let typing = client.typing_users().await;
                    if !typing.is_empty() {
                        println!("… {} escribiendo", typing.join(", "));
                    }
                }
                ClientEvent::ConnectionChanged(true) => println!("* conectado"),
                ClientEvent::ConnectionChanged(false) => println!("* sin conexión"),
                ClientEvent::PresenceChanged => {}
                ClientEvent::Error(err) => eprintln!("! {err}"),
            }
        }
    })
}

async fn run_command(client: &Arc<RealtimeClient>, command: Command) -> Result<bool> {
    match command {
        Command::Nothing => {}
        Command::Quit => return Ok(false),
        Command::Invalid(reason) => eprintln!("! {reason}"),
        Command::Send(text) => {
            if let Err(err) = client.send_message(SendIntent::text(text)).await {
                eprintln!("! {err}");
            }
        }
        Command::Attach { kind, path, text } => {
            let attachment = LocalAttachment::from_path(kind, &path).await?;
            if let Err(err) = client
                .send_message(SendIntent::text(text).with_attachment(attachment))
                .await
            {
                eprintln!("! {err}");
            }
        }
        Command::Reply(message_id) => {
            match client.set_replying_to(Some(message_id.clone())).await {
                Some(preview) => {
                    println!("respondiendo a {}: {}", preview.username, preview.text_preview)
                }
                None => eprintln!("! unknown message {message_id}"),
            }
        }
        Command::CancelReply => {
            client.set_replying_to(None).await;
        }
        Command::React { message_id, emoji } => {
            if let Err(err) = client.toggle_reaction(&message_id, &emoji).await {
                eprintln!("! {err}");
            }
        }
        Command::Members => {
            for member in client.members().await {
                let marker = if member.is_online { "●" } else { "○" };
                println!("{marker} {} (@{})", member.name, member.username);
            }
        }
        Command::StartTyping => client.notify_typing().await,
        Command::Typing => {
            let typing = client.typing_users().await;
            if typing.is_empty() {
                println!("nadie está escribiendo");
            } else {
                println!("{} escribiendo", typing.join(", "));
            }
        }
        Command::History => {
            for message in client.messages().await {
                let pending = client.has_pending_reaction(&message.id).await;
                println!("{}", format_message(&message, pending));
            }
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = load_settings(args.config.as_deref())?;
    let settings = args.apply(settings);
    settings.require_identity()?;

    let client = RealtimeClient::from_settings(&settings).await?;
    let printer = spawn_event_printer(&client);
    client.start().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_command(&client, parse_command(&line)).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => eprintln!("! {err:#}"),
        }
    }

    client.logout().await;
    printer.abort();
    Ok(())
}
